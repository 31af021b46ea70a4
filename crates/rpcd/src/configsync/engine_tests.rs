// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine scenarios: round trips, stream recovery, refresh trimming,
//! at-least-once delivery under injected transport failures.

use super::*;
use crate::testing::{MemConfig, MockCloud};
use ap_cloud::cloud_rpc::cfg_prop_op::Operation;
use ap_cloud::cloud_rpc::{CfgCmd, CfgPropOp};
use ap_core::CfgOpKind;

struct Rig {
    engine: Arc<SyncEngine>,
    cloud: Arc<MockCloud>,
    cfg: Arc<MemConfig>,
    dones: Vec<mpsc::Sender<bool>>,
    restart_rx: mpsc::Receiver<String>,
}

impl Rig {
    fn new() -> Self {
        let cloud = MockCloud::new();
        let cfg = MemConfig::new();
        let (queues, updated_rx) = SyncQueues::new();
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let engine = SyncEngine::new(
            cloud.clone(),
            cfg.clone(),
            Arc::new(queues),
            Metrics::new(),
            restart_tx,
            Arc::new(parking_lot::Mutex::new(String::new())),
        );

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

        Self { engine, cloud, cfg, dones, restart_rx }
    }

    async fn stop(self) {
        for done in &self.dones {
            let _ = done.send(true).await;
        }
    }
}

fn set_op(property: &str, value: &str) -> CfgPropOp {
    CfgPropOp {
        op: Operation::Set as i32,
        property: property.to_string(),
        value: value.to_string(),
        expires: None,
    }
}

fn refresh_cmd(cmd_id: i64) -> CfgCmd {
    CfgCmd {
        cmd_id,
        ops: vec![CfgPropOp {
            op: Operation::Get as i32,
            property: "@/".to_string(),
            value: String::new(),
            expires: None,
        }],
    }
}

async fn settle() {
    // Paused-clock tests: yield enough times for the loops to tick.
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn config_round_trip() {
    let rig = Rig::new();
    rig.cloud.push_batch(vec![CfgCmd { cmd_id: 42, ops: vec![set_op("@/foo", "bar")] }]);

    settle().await;

    // Command executed against the local tree
    assert_eq!(rig.cfg.value("@/foo").as_deref(), Some("bar"));
    // Completion reached the cloud with OK
    let sent = rig.cloud.sent_completions.lock().clone();
    assert!(
        sent.iter().any(|c| c.cmd_id == 42
            && c.status == cloud_rpc::cfg_completion::Status::Ok as i32),
        "completions: {sent:?}"
    );
    assert_eq!(rig.engine.queues().last_cmd_id(), 42);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn broken_stream_resumes_from_high_water_mark() {
    let rig = Rig::new();
    let first: Vec<CfgCmd> = (1..=10)
        .map(|id| CfgCmd { cmd_id: id, ops: vec![set_op(&format!("@/n/{id}"), "x")] })
        .collect();
    rig.cloud.push_batch(first);

    settle().await;
    assert_eq!(rig.engine.queues().last_cmd_id(), 10);

    rig.cloud.push_batch(vec![CfgCmd { cmd_id: 11, ops: vec![set_op("@/n/11", "x")] }]);
    settle().await;

    // Every fetch after the first resumed at last_cmd_id = 10
    let requests = rig.cloud.fetch_requests.lock().clone();
    assert_eq!(requests[0], 0);
    assert!(requests[1..].iter().all(|&id| id >= 10), "{requests:?}");

    // Commands 1-10 were executed exactly once
    let sets = rig
        .cfg
        .executed
        .lock()
        .iter()
        .filter(|op| op.op == CfgOpKind::Set && op.prop == "@/n/5")
        .count();
    assert_eq!(sets, 1);
    assert_eq!(rig.engine.queues().last_cmd_id(), 11);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn refresh_dup_trim_executes_one_refresh_and_drops_updates() {
    let rig = Rig::new();

    // Queue updates that the refresh must subsume
    for i in 0..3 {
        rig.engine.queues().append_update(cloud_rpc::CfgUpdate {
            r#type: 0,
            property: format!("@/stale/{i}"),
            value: "v".to_string(),
            hash: vec![1],
            expires: None,
        });
    }

    rig.cloud.push_batch(vec![
        refresh_cmd(1),
        CfgCmd { cmd_id: 2, ops: vec![set_op("@/keep", "yes")] },
        refresh_cmd(3),
        refresh_cmd(4),
    ]);

    settle().await;

    let refreshes = rig
        .cfg
        .executed
        .lock()
        .iter()
        .filter(|op| op.op == CfgOpKind::Get && op.prop == "@/")
        .count();
    assert_eq!(refreshes, 1, "only the first refresh in a batch executes");
    assert_eq!(rig.cfg.value("@/keep").as_deref(), Some("yes"));

    // Stale updates never reached the cloud
    assert!(rig.cloud.sent_updates.lock().iter().all(|u| !u.property.starts_with("@/stale/")));
    // The nulled refreshes still advanced the high-water mark
    assert_eq!(rig.engine.queues().last_cmd_id(), 4);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn push_failure_requeues_and_resends() {
    let rig = Rig::new();
    *rig.cloud.fail_completions.lock() = 1;
    rig.cloud.push_batch(vec![CfgCmd { cmd_id: 5, ops: vec![set_op("@/a", "1")] }]);
    // Stream for the reconnect after the injected failure
    rig.cloud.push_batch(vec![]);

    settle().await;

    let sent = rig.cloud.sent_completions.lock().clone();
    assert!(sent.iter().any(|c| c.cmd_id == 5), "requeued completion must be resent: {sent:?}");
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restore_rule_strips_flag_and_replaces_tree() {
    let rig = Rig::new();
    rig.cfg.seed(RESTORE_PROP, "true");
    let tree = serde_json::json!({
        "children": {
            "cloud": { "children": { "restore_config": { "value": "true" } } },
            "site": { "value": "kept" }
        }
    });
    *rig.cloud.download_response.lock() = Some(cloud_rpc::Download {
        result: cloud_rpc::download::Result::Ok as i32,
        value: tree.to_string(),
    });
    rig.cloud.push_batch(vec![]);

    settle().await;

    let replaced = rig.cfg.replaced.lock().clone().expect("tree should be replaced");
    assert!(replaced.contains("kept"));
    assert!(!replaced.contains("restore_config"), "flag must be stripped: {replaced}");
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restore_noconfig_clears_flag() {
    let rig = Rig::new();
    rig.cfg.seed(RESTORE_PROP, "true");
    *rig.cloud.download_response.lock() = Some(cloud_rpc::Download {
        result: cloud_rpc::download::Result::Noconfig as i32,
        value: String::new(),
    });
    rig.cloud.push_batch(vec![]);

    settle().await;

    assert!(rig.cfg.value(RESTORE_PROP).is_none(), "restore flag should be deleted");
    assert!(rig.cfg.replaced.lock().is_none());
    assert!(rig.engine.is_connected());
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn endpoint_change_requests_restart() {
    let mut rig = Rig::new();
    let wire = cloud_rpc::CfgUpdate {
        r#type: 0,
        property: "@/cloud/svc_rpc/0/host".to_string(),
        value: "svc2.b10e.net".to_string(),
        hash: vec![9],
        expires: None,
    };
    rig.engine.on_config_event(&prost::Message::encode_to_vec(&wire));
    assert_eq!(rig.restart_rx.try_recv().unwrap(), "cloud endpoint changed");
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn bucket_change_updates_cached_bucket() {
    let rig = Rig::new();
    let wire = cloud_rpc::CfgUpdate {
        r#type: 0,
        property: BUCKET_PROP.to_string(),
        value: "gs://updates-acme".to_string(),
        hash: vec![9],
        expires: None,
    };
    rig.engine.on_config_event(&prost::Message::encode_to_vec(&wire));
    assert_eq!(rig.engine.update_bucket(), "gs://updates-acme");
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn at_least_once_under_injected_failures() {
    let rig = Rig::new();
    *rig.cloud.fail_updates.lock() = 2;
    *rig.cloud.fail_completions.lock() = 1;
    // Several reconnect cycles' worth of empty streams
    for _ in 0..8 {
        rig.cloud.push_batch(vec![]);
    }

    let mut appended = Vec::new();
    for i in 0..10 {
        let wire = cloud_rpc::CfgUpdate {
            r#type: 0,
            property: format!("@/p/{i}"),
            value: "v".to_string(),
            hash: vec![i],
            expires: None,
        };
        rig.engine.on_config_event(&prost::Message::encode_to_vec(&wire));
        appended.push(format!("@/p/{i}"));
    }

    settle().await;
    settle().await;

    let sent: Vec<String> =
        rig.cloud.sent_updates.lock().iter().map(|u| u.property.clone()).collect();
    for prop in &appended {
        assert!(sent.contains(prop), "{prop} never delivered; sent: {sent:?}");
    }
    rig.stop().await;
}

#[test]
fn strip_restore_flag_tolerates_missing_subtree() {
    let json = r#"{"children":{"site":{"value":"x"}}}"#;
    let out = strip_restore_flag(json).unwrap();
    assert!(out.contains("site"));
    assert!(strip_restore_flag("not json").is_err());
}
