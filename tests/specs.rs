// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace-level scenarios wiring several subsystems together through
//! their public APIs, with the in-memory collaborators standing in for
//! the local daemons and the cloud.

mod prelude {
    pub use ap_cloud::cloud_rpc;
    pub use ap_rpcd::configsync::{SyncEngine, SyncQueues};
    pub use ap_rpcd::metrics::Metrics;
    pub use ap_rpcd::testing::{MemBroker, MemConfig, MockCloud};
    pub use ap_rpcd::uploaders::{EventSender, FaultUploader};
    pub use std::sync::Arc;
    pub use std::time::Duration;
    pub use tokio::sync::mpsc;
}

use prelude::*;

struct Engine {
    engine: Arc<SyncEngine>,
    cloud: Arc<MockCloud>,
    cfg: Arc<MemConfig>,
    broker: Arc<MemBroker>,
    dones: Vec<mpsc::Sender<bool>>,
}

async fn start_engine() -> Engine {
    let cloud = MockCloud::new();
    let cfg = MemConfig::new();
    let broker = MemBroker::new();
    let (queues, updated_rx) = SyncQueues::new();
    let (restart_tx, _restart_rx) = mpsc::channel(1);
    let engine = SyncEngine::new(
        cloud.clone(),
        cfg.clone(),
        Arc::new(queues),
        Metrics::new(),
        restart_tx,
        Arc::new(parking_lot::Mutex::new(String::new())),
    );
    Arc::clone(&engine).register_config_handler(broker.as_ref()).await.unwrap();

    let mut dones = Vec::new();
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(Arc::clone(&engine).connect_loop(rx));
    dones.push(tx);
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(Arc::clone(&engine).pull_loop(rx));
    dones.push(tx);
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(Arc::clone(&engine).push_loop(updated_rx, rx));
    dones.push(tx);
    Engine { engine, cloud, cfg, broker, dones }
}

async fn settle() {
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

/// A change published on the local broker's config topic ends up queued
/// and delivered to the cloud as a `BackEndUpdate`.
#[tokio::test(start_paused = true)]
async fn local_change_reaches_cloud() {
    let rig = start_engine().await;
    rig.cloud.push_batch(vec![]);

    let wire = cloud_rpc::CfgUpdate {
        r#type: 0,
        property: "@/site/name".to_string(),
        value: "lab".to_string(),
        hash: vec![7],
        expires: None,
    };
    rig.broker.publish("config", &prost::Message::encode_to_vec(&wire));

    settle().await;

    let sent = rig.cloud.sent_updates.lock().clone();
    assert!(sent.iter().any(|u| u.property == "@/site/name" && u.value == "lab"), "{sent:?}");
    for done in &rig.dones {
        let _ = done.send(true).await;
    }
}

/// Cloud command execution is reflected in the local tree and completed
/// back to the cloud, surviving an injected completion failure.
#[tokio::test(start_paused = true)]
async fn command_completion_survives_transport_flap() {
    let rig = start_engine().await;
    *rig.cloud.fail_completions.lock() = 1;
    rig.cloud.push_batch(vec![cloud_rpc::CfgCmd {
        cmd_id: 9,
        ops: vec![cloud_rpc::CfgPropOp {
            op: cloud_rpc::cfg_prop_op::Operation::Set as i32,
            property: "@/network/ssid".to_string(),
            value: "brightlab".to_string(),
            expires: None,
        }],
    }]);
    for _ in 0..4 {
        rig.cloud.push_batch(vec![]);
    }

    settle().await;
    settle().await;

    assert_eq!(rig.cfg.value("@/network/ssid").as_deref(), Some("brightlab"));
    let sent = rig.cloud.sent_completions.lock().clone();
    assert!(sent.iter().any(|c| c.cmd_id == 9), "completion must survive the flap: {sent:?}");
    assert!(rig.engine.queues().last_cmd_id() >= 9);
    for done in &rig.dones {
        let _ = done.send(true).await;
    }
}

/// Fault files written by one subsystem are shipped and marked by the
/// uploader on its next pass.
#[tokio::test]
async fn fault_spool_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let spool = dir.path().join("faults");
    let cloud = MockCloud::new();
    let (restart_tx, _) = mpsc::channel(1);
    let sender = EventSender::new(cloud.clone(), MemConfig::new(), Metrics::new(), restart_tx);

    let body = serde_json::json!({ "kind": "upgrade", "error": "hash mismatch" }).to_string();
    ap_rpcd::uploaders::faults::write_fault(
        &spool,
        "upgrade",
        chrono_now(),
        body.as_bytes(),
    )
    .unwrap();

    let uploader = FaultUploader::new(sender, spool.clone(), ap_core::SystemClock);
    uploader.upload(false).await.unwrap();

    let shipped = cloud.events.lock().iter().filter(|(t, _)| t == "fault").count();
    assert_eq!(shipped, 1);
    let names: Vec<String> = std::fs::read_dir(&spool)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().all(|n| n.contains(".uploaded.")), "{names:?}");
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    ap_core::Clock::wall(&ap_core::SystemClock)
}
