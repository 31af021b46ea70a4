// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon startup and orchestration: build the shared stack, spawn the
//! loops, drain them on signal.

use crate::adapters::{UnixBroker, UnixConfigHandle};
use crate::certs::{CertController, FsInstaller};
use crate::configsync::{SyncEngine, SyncQueues};
use crate::credential::{Credential, CredentialError};
use crate::mcp::McpClient;
use crate::metrics::Metrics;
use crate::release::ReleaseController;
use crate::transport::{self, Backoff, CloudEndpoint};
use crate::tunnel::{SystemSsh, TunnelSupervisor};
use crate::uploaders::{EventSender, FaultUploader, InventoryUploader};
use crate::{cloud_api::CloudClient, env, uploaders};
use ap_core::platform::DirTag;
use ap_core::{
    Broker, CfgError, ConfigHandle, LinuxPlatform, Platform, SupervisorState, SystemClock,
    TOPIC_DEVICE_INVENTORY,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("config daemon unreachable: {0}")]
    Config(#[from] CfgError),

    #[error("credential unavailable: {0}")]
    Credential(#[from] CredentialError),

    #[error("broker unreachable: {0}")]
    Broker(#[from] std::io::Error),
}

/// Why the daemon stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitReason {
    Signal,
    /// Internal restart request; mcp relaunches us with fresh state.
    Restart(String),
}

/// One done-channel per loop, signalled exactly once at shutdown.
struct LoopSet {
    tracker: TaskTracker,
    dones: Vec<(&'static str, mpsc::Sender<bool>)>,
}

impl LoopSet {
    fn new() -> Self {
        Self { tracker: TaskTracker::new(), dones: Vec::new() }
    }

    fn spawn<F>(&mut self, name: &'static str, f: impl FnOnce(mpsc::Receiver<bool>) -> F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        self.dones.push((name, tx));
        self.tracker.spawn(f(rx));
    }

    async fn drain(self) {
        for (name, done) in &self.dones {
            if done.send(true).await.is_err() {
                warn!(target: "shutdown", %name, "loop already gone");
            }
        }
        self.tracker.close();
        if tokio::time::timeout(env::drain_timeout(), self.tracker.wait()).await.is_err() {
            warn!("drain timeout expired with loops still running");
        }
    }
}

/// Run the daemon to completion.
pub async fn run() -> Result<ExitReason, StartupError> {
    let platform: Arc<dyn Platform> = Arc::new(LinuxPlatform::probe(env::aproot()));
    let run_dir = platform.expand_dir_path(DirTag::Run, "");
    let mcp = McpClient::new(run_dir.join("mcp.sock"));

    match startup(Arc::clone(&platform), &mcp).await {
        Ok(reason) => Ok(reason),
        Err(e) => {
            error!(error = %e, "fatal startup error");
            mcp.set_state(SupervisorState::Broken).await;
            Err(e)
        }
    }
}

async fn startup(platform: Arc<dyn Platform>, mcp: &McpClient) -> Result<ExitReason, StartupError> {
    let run_dir = platform.expand_dir_path(DirTag::Run, "");
    let boot_time = platform.boot_time();
    info!(version = env::VERSION, platform = platform.platform_name(), "ap.rpcd starting");

    // Local collaborators. A missing config daemon or broker is fatal.
    let cfg: Arc<dyn ConfigHandle> = {
        let handle = UnixConfigHandle::new(run_dir.join("configd.sock"));
        handle.ping().await?;
        Arc::new(handle)
    };
    let broker = UnixBroker::new(run_dir.join("brokerd.sock"));

    // Credential, then a validated channel (retrying dial forever).
    let secret_path = platform.expand_dir_path(DirTag::Secret, "rpcd/cloud.secret.json");
    let cred = Arc::new(Credential::load(&secret_path)?);
    let endpoint = CloudEndpoint::discover(cfg.as_ref()).await;
    let conn = dial_with_backoff(&endpoint, Arc::clone(&cred), boot_time).await;
    let cloud: Arc<dyn CloudClient> = Arc::new(conn);

    let metrics = Metrics::new();
    let (restart_tx, mut restart_rx) = mpsc::channel::<String>(4);

    // Update bucket cell, shared by the sync engine and the release
    // controller; seeded from the tree.
    let bucket = Arc::new(Mutex::new(
        cfg.get_prop("@/cloud/update/bucket").await.unwrap_or_default(),
    ));

    // Config-sync engine.
    let (queues, updated_rx) = SyncQueues::new();
    let engine = SyncEngine::new(
        Arc::clone(&cloud),
        Arc::clone(&cfg),
        Arc::new(queues),
        Arc::clone(&metrics),
        restart_tx.clone(),
        Arc::clone(&bucket),
    );
    Arc::clone(&engine).register_config_handler(&broker).await?;

    // Uploaders.
    let sender = EventSender::new(
        Arc::clone(&cloud),
        Arc::clone(&cfg),
        Arc::clone(&metrics),
        restart_tx.clone(),
    );
    let inventory = InventoryUploader::new(
        sender.clone(),
        platform.expand_dir_path(DirTag::Data, "identifierd"),
        platform.expand_dir_path(DirTag::Data, "rpcd/identifierd.json.v1"),
        SystemClock,
    );
    let (inventory_wake_tx, inventory_wake_rx) = mpsc::channel(1);
    broker
        .handle(
            TOPIC_DEVICE_INVENTORY,
            Arc::new(move |_| {
                let _ = inventory_wake_tx.try_send(());
            }),
        )
        .await?;
    let fault_spool = platform.expand_dir_path(DirTag::Data, "faults");
    let faults = FaultUploader::new(sender.clone(), fault_spool.clone(), SystemClock);

    // Certificate controller.
    let certs = CertController::new(
        Arc::clone(&cloud),
        Arc::clone(&cfg),
        Arc::new(FsInstaller::new(platform.expand_dir_path(DirTag::Secret, "ssl"))),
        SystemClock,
    );
    if let Err(e) = certs.register_watches().await {
        warn!(error = %e, "cert watches unavailable");
    }

    // Release controller.
    let release = ReleaseController::new(
        Arc::clone(&cloud),
        sender.clone(),
        Arc::clone(&cfg),
        Arc::clone(&platform),
        platform.expand_dir_path(DirTag::Data, "release"),
        platform.root().join("etc/release.json"),
        platform.root().join("etc/versions"),
        fault_spool,
        Arc::clone(&bucket),
        SystemClock,
    );
    if let Err(e) = Arc::clone(&release).register_watch().await {
        warn!(error = %e, "release watch unavailable");
    }
    release.report_startup().await;

    // Tunnel supervisor.
    let tunnel = TunnelSupervisor::new(
        Arc::clone(&cfg),
        Arc::new(SystemSsh),
        run_dir.join("service-tunnel"),
        SystemClock,
    );
    if let Err(e) = tunnel.register_watches().await {
        warn!(error = %e, "tunnel watches unavailable");
    }

    // Spawn everything.
    let mut loops = LoopSet::new();
    loops.spawn("connect", |done| Arc::clone(&engine).connect_loop(done));
    loops.spawn("pull", |done| Arc::clone(&engine).pull_loop(done));
    loops.spawn("push", |done| Arc::clone(&engine).push_loop(updated_rx, done));
    loops.spawn("heartbeat", {
        let sender = sender.clone();
        |done| uploaders::heartbeat::run(sender, boot_time, SystemClock, done)
    });
    loops.spawn("inventory", |done| inventory.run(inventory_wake_rx, done));
    loops.spawn("faults", |done| faults.run(done));
    loops.spawn("certs", |done| certs.run(done));
    loops.spawn("tunnel", |done| tunnel.run(done));
    loops.tracker.spawn(crate::metrics::serve(Arc::clone(&metrics), env::diag_port()));

    mcp.set_state(SupervisorState::Ok).await;
    info!("all loops running");

    // Wait for a stop signal or an internal restart request.
    let reason = tokio::select! {
        _ = shutdown_signal() => ExitReason::Signal,
        reason = restart_rx.recv() => {
            ExitReason::Restart(reason.unwrap_or_else(|| "restart channel closed".to_string()))
        }
    };
    match &reason {
        ExitReason::Signal => info!("stop signal received, draining"),
        ExitReason::Restart(why) => info!(%why, "restart requested, draining"),
    }
    loops.drain().await;
    info!("shutdown complete");
    Ok(reason)
}

/// Dial until it works, doubling the delay up to the 30-minute cap.
async fn dial_with_backoff(
    endpoint: &CloudEndpoint,
    cred: Arc<Credential>,
    boot_time: chrono::DateTime<chrono::Utc>,
) -> transport::CloudConn {
    let mut backoff = Backoff::new();
    loop {
        match transport::dial(endpoint, Arc::clone(&cred), boot_time).await {
            Ok(conn) => return conn,
            Err(e) => {
                let delay = backoff.next();
                warn!(error = %e, delay_secs = delay.as_secs(), "cloud dial failed");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
