// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config synchronization: the full-duplex conversation with the cloud.
//!
//! Three cooperating loops share one queue record and a connected flag:
//! the connect loop establishes the session, the pull loop consumes the
//! server-streamed command feed and executes commands locally, and the
//! push loop drains queued updates and completions back to the cloud.

mod queue;
mod translate;

pub use queue::{SyncQueues, MAX_COMPLETIONS, MAX_UPDATES};

use crate::cloud_api::CloudClient;
use crate::env;
use crate::metrics::Metrics;
use ap_cloud::cloud_rpc;
use ap_core::config::PropNode;
use ap_core::{Broker, CfgError, ConfigHandle, TOPIC_CONFIG};
use futures_util::StreamExt;
use parking_lot::Mutex;
use prost::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Commands requested per `FetchStream` call.
const MAX_CMDS: u32 = 64;

/// Tick driving all three loops.
const TICK: Duration = Duration::from_secs(1);

/// Disconnected-state errors are logged at most this often.
const ERR_LOG_INTERVAL: Duration = Duration::from_secs(600);

const RESTORE_PROP: &str = "@/cloud/restore_config";
const ENDPOINT_SUBTREE: &str = "@/cloud/svc_rpc/";
const BUCKET_PROP: &str = "@/cloud/update/bucket";

pub struct SyncEngine {
    cloud: Arc<dyn CloudClient>,
    cfg: Arc<dyn ConfigHandle>,
    queues: Arc<SyncQueues>,
    connected: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    /// Asks the orchestrator for a clean daemon restart.
    restart_tx: mpsc::Sender<String>,
    /// Cloud-storage bucket for update artifacts, maintained by the
    /// config-event handler.
    update_bucket: Arc<Mutex<String>>,
}

impl SyncEngine {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        cfg: Arc<dyn ConfigHandle>,
        queues: Arc<SyncQueues>,
        metrics: Arc<Metrics>,
        restart_tx: mpsc::Sender<String>,
        update_bucket: Arc<Mutex<String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            cfg,
            queues,
            connected: Arc::new(AtomicBool::new(false)),
            metrics,
            restart_tx,
            update_bucket,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn queues(&self) -> &Arc<SyncQueues> {
        &self.queues
    }

    pub fn update_bucket(&self) -> String {
        self.update_bucket.lock().clone()
    }

    // ------------------------------------------------------------ connect

    /// Establish (and re-establish) the cloud session.
    pub async fn connect_loop(self: Arc<Self>, mut done: mpsc::Receiver<bool>) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_logged: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = done.recv() => return,
                _ = tick.tick() => {}
            }
            if self.is_connected() {
                continue;
            }
            match self.cloud.hello(env::VERSION).await {
                Ok(()) => {
                    if let Err(e) = self.maybe_restore().await {
                        warn!(error = %e, "config restore failed, retrying");
                        continue;
                    }
                    self.connected.store(true, Ordering::SeqCst);
                    self.metrics.reconnects.inc();
                    last_logged = None;
                    info!("cloud config session established");
                    self.queues.poke();
                }
                Err(e) => {
                    let due = last_logged.map(|t| t.elapsed() >= ERR_LOG_INTERVAL).unwrap_or(true);
                    if due {
                        warn!(error = %e, "cloud hello failed");
                        last_logged = Some(Instant::now());
                    }
                }
            }
        }
    }

    /// Apply the one-shot tree restore when `@/cloud/restore_config` asks
    /// for it. Runs before any push/pull traffic on a fresh session.
    async fn maybe_restore(&self) -> Result<(), CfgError> {
        match self.cfg.get_prop(RESTORE_PROP).await {
            Ok(v) if v == "true" => {}
            _ => return Ok(()),
        }
        let dl = self
            .cloud
            .download()
            .await
            .map_err(|e| CfgError::Comm(format!("download: {e}")))?;
        let noconfig = dl.result == cloud_rpc::download::Result::Noconfig as i32;
        if noconfig || dl.value.is_empty() {
            // The cloud has nothing stored for us; clear the flag so we
            // don't ask again on every reconnect.
            info!("cloud has no stored config, skipping restore");
            self.cfg.delete_prop(RESTORE_PROP).await?;
            return Ok(());
        }
        if dl.result != cloud_rpc::download::Result::Ok as i32 {
            return Err(CfgError::Comm("download returned error".to_string()));
        }
        let stripped = strip_restore_flag(&dl.value)?;
        self.cfg.replace(&stripped).await?;
        info!("config tree restored from cloud");
        Ok(())
    }

    // ------------------------------------------------------------ pull

    /// Consume the server-streamed command feed.
    pub async fn pull_loop(self: Arc<Self>, mut done: mpsc::Receiver<bool>) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done.recv() => return,
                _ = tick.tick() => {}
            }
            if !self.is_connected() {
                continue;
            }
            let mut stream =
                match self.cloud.fetch_stream(self.queues.last_cmd_id(), MAX_CMDS).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "command fetch failed");
                        self.connected.store(false, Ordering::SeqCst);
                        continue;
                    }
                };
            loop {
                // Back-pressure: when the completion backlog doubles the
                // drain size, give the push loop a chance to catch up
                // before reading more commands.
                while self.queues.completions_len() > 2 * MAX_COMPLETIONS {
                    tokio::select! {
                        _ = done.recv() => return,
                        _ = tokio::time::sleep(TICK) => {}
                    }
                }
                tokio::select! {
                    _ = done.recv() => return,
                    next = stream.next() => match next {
                        Some(Ok(resp)) => self.process_batch(resp.cmds).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "command stream broken");
                            self.connected.store(false, Ordering::SeqCst);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Execute one streamed batch and queue its completions.
    async fn process_batch(&self, cmds: Vec<cloud_rpc::CfgCmd>) {
        // Refresh-dup trim: a batch needs at most one full-tree refresh,
        // and a refresh makes every queued update stale.
        let refreshes: Vec<usize> = cmds
            .iter()
            .enumerate()
            .filter(|(_, cmd)| translate::is_refresh(cmd))
            .map(|(i, _)| i)
            .collect();
        if !refreshes.is_empty() {
            let dropped = self.queues.drop_updates();
            if dropped > 0 {
                debug!(dropped, "dropped queued updates ahead of tree refresh");
            }
        }
        let skip: std::collections::HashSet<usize> =
            refreshes.iter().skip(1).copied().collect();

        for (i, cmd) in cmds.iter().enumerate() {
            if skip.contains(&i) {
                self.queues.observe_cmd_id(cmd.cmd_id);
                continue;
            }
            let result = match translate::to_local_ops(cmd) {
                Ok(ops) => self.cfg.execute(&ops).await,
                Err(e) => Err(e),
            };
            if let Err(ref e) = result {
                warn!(cmd_id = cmd.cmd_id, error = %e, "cloud command failed");
            }
            self.metrics.commands_executed.inc();
            self.queues.append_completion(translate::completion_for(cmd.cmd_id, &result));
            self.queues.observe_cmd_id(cmd.cmd_id);
        }
    }

    // ------------------------------------------------------------ push

    /// Drain queued completions and updates to the cloud.
    pub async fn push_loop(
        self: Arc<Self>,
        mut updated: mpsc::Receiver<()>,
        mut done: mpsc::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done.recv() => return,
                _ = updated.recv() => {}
                _ = tick.tick() => {}
            }
            if !self.is_connected() {
                continue;
            }

            let batch = self.queues.drain_completions(MAX_COMPLETIONS);
            if !batch.is_empty() {
                let n = batch.len() as u64;
                if let Err(e) = self.cloud.complete_cmds(batch.clone()).await {
                    warn!(error = %e, queued = batch.len(), "completion push failed");
                    self.queues.requeue_completions(batch);
                    self.connected.store(false, Ordering::SeqCst);
                    continue;
                }
                self.metrics.completions_sent.inc_by(n);
            }

            let batch = self.queues.drain_updates(MAX_UPDATES);
            if !batch.is_empty() {
                let n = batch.len() as u64;
                if let Err(e) = self.cloud.update(batch.clone()).await {
                    warn!(error = %e, queued = batch.len(), "update push failed");
                    self.queues.requeue_updates(batch);
                    self.connected.store(false, Ordering::SeqCst);
                    continue;
                }
                self.metrics.updates_sent.inc_by(n);
            }
        }
    }

    // ------------------------------------------------------------ events

    /// Subscribe to the local broker's config topic; every tree change is
    /// queued for the cloud.
    pub async fn register_config_handler(
        self: Arc<Self>,
        broker: &dyn Broker,
    ) -> std::io::Result<()> {
        let engine = Arc::clone(&self);
        broker.handle(TOPIC_CONFIG, Arc::new(move |payload| engine.on_config_event(payload))).await
    }

    fn on_config_event(&self, payload: &[u8]) {
        let wire = match cloud_rpc::CfgUpdate::decode(payload) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(error = %e, "undecodable config event");
                return;
            }
        };

        if wire.property.starts_with(ENDPOINT_SUBTREE) {
            info!(property = %wire.property, "cloud endpoint changed, requesting restart");
            let _ = self.restart_tx.try_send("cloud endpoint changed".to_string());
        } else if wire.property == BUCKET_PROP {
            *self.update_bucket.lock() = wire.value.clone();
            debug!(bucket = %wire.value, "update bucket changed");
        }

        let Some(update) = translate::from_broker_event(&wire) else {
            return;
        };
        self.queues.append_update(translate::to_cloud_update(&update));
    }
}

/// Remove `@/cloud/restore_config` from a serialized tree so a restored
/// appliance doesn't immediately restore again.
fn strip_restore_flag(tree_json: &str) -> Result<String, CfgError> {
    let mut tree: PropNode =
        serde_json::from_str(tree_json).map_err(|e| CfgError::BadProp(e.to_string()))?;
    if let Some(cloud) = tree.children.get_mut("cloud") {
        cloud.children.remove("restore_config");
    }
    serde_json::to_string(&tree).map_err(|e| CfgError::BadProp(e.to_string()))
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
