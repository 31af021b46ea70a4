// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Service-tunnel supervisor.
//!
//! A cloud operator reaches the appliance through a short-lived local
//! sshd plus a reverse tunnel to the bastion, driven entirely by the six
//! properties under `@/cloud/service/`. Watch callbacks enqueue property
//! changes; a one-second tick reconciles the machine.

mod reverse;
mod sshd;

pub use reverse::TunnelSpec;

use ap_core::config::CfgOp;
use ap_core::{CfgError, Clock, ConfigHandle};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

const PROP_BASE: &str = "@/cloud/service";

const KEY_CLOUD_HOST: &str = "cloud_host";
const KEY_CLOUD_USER: &str = "cloud_user";
const KEY_CLOUD_HOST_KEY: &str = "cloud_host_key";
const KEY_TUNNEL_PORT: &str = "tunnel_port";
const KEY_TUNNEL_USER_KEY: &str = "tunnel_user_key";
const KEY_CLOUD_USER_KEY: &str = "cloud_user_key";

/// The tunnel must come up when all four are populated.
const NEEDED_KEYS: [&str; 4] =
    [KEY_CLOUD_HOST, KEY_CLOUD_USER, KEY_CLOUD_HOST_KEY, KEY_TUNNEL_PORT];

const TICK: Duration = Duration::from_secs(1);
/// Backoff after an sshd spawn failure.
const DAEMON_RETRY: Duration = Duration::from_secs(24 * 60 * 60);
/// Backoff after a tunnel open failure.
const TUNNEL_RETRY: Duration = Duration::from_secs(5);
/// Lifetime of the published tunnel user key, and thus of the tunnel.
const TUNNEL_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Seam over the ssh primitives so the state machine tests without
/// spawning real processes.
#[async_trait]
pub trait SshOps: Send + Sync {
    async fn spawn_sshd(
        &self,
        run_dir: &Path,
        authorized_key: Option<&str>,
    ) -> std::io::Result<Box<dyn SshDaemon>>;

    async fn authorize(&self, run_dir: &Path, key: Option<&str>) -> std::io::Result<()>;

    async fn open_tunnel(
        &self,
        run_dir: &Path,
        spec: &TunnelSpec,
    ) -> std::io::Result<Box<dyn SshTunnel>>;

    async fn generate_keypair(&self, run_dir: &Path) -> std::io::Result<(PathBuf, String)>;

    async fn remove_key_material(&self, run_dir: &Path);
}

#[async_trait]
pub trait SshDaemon: Send {
    fn port(&self) -> u16;
    fn alive(&mut self) -> bool;
    async fn finalize(self: Box<Self>);
}

#[async_trait]
pub trait SshTunnel: Send {
    fn alive(&mut self) -> bool;
    async fn close(self: Box<Self>);
}

/// Production ssh primitives.
pub struct SystemSsh;

#[async_trait]
impl SshOps for SystemSsh {
    async fn spawn_sshd(
        &self,
        run_dir: &Path,
        authorized_key: Option<&str>,
    ) -> std::io::Result<Box<dyn SshDaemon>> {
        Ok(Box::new(sshd::SshdHandle::spawn(run_dir, authorized_key).await?))
    }

    async fn authorize(&self, run_dir: &Path, key: Option<&str>) -> std::io::Result<()> {
        sshd::write_authorized_keys(run_dir, key).await
    }

    async fn open_tunnel(
        &self,
        run_dir: &Path,
        spec: &TunnelSpec,
    ) -> std::io::Result<Box<dyn SshTunnel>> {
        Ok(Box::new(reverse::TunnelHandle::open(run_dir, spec).await?))
    }

    async fn generate_keypair(&self, run_dir: &Path) -> std::io::Result<(PathBuf, String)> {
        reverse::generate_keypair(run_dir).await
    }

    async fn remove_key_material(&self, run_dir: &Path) {
        for file in ["tunnel_user_key", "tunnel_user_key.pub", "known_hosts"] {
            let _ = tokio::fs::remove_file(run_dir.join(file)).await;
        }
    }
}

#[async_trait]
impl SshDaemon for sshd::SshdHandle {
    fn port(&self) -> u16 {
        sshd::SshdHandle::port(self)
    }

    fn alive(&mut self) -> bool {
        sshd::SshdHandle::alive(self)
    }

    async fn finalize(self: Box<Self>) {
        sshd::SshdHandle::finalize(*self).await;
    }
}

#[async_trait]
impl SshTunnel for reverse::TunnelHandle {
    fn alive(&mut self) -> bool {
        reverse::TunnelHandle::alive(self)
    }

    async fn close(self: Box<Self>) {
        reverse::TunnelHandle::close(*self).await;
    }
}

/// Children and retry gates, owned by the supervisor loop.
#[derive(Default)]
struct Machine {
    daemon: Option<Box<dyn SshDaemon>>,
    tunnel: Option<Box<dyn SshTunnel>>,
    next_daemon_attempt: Option<Instant>,
    next_tunnel_attempt: Option<Instant>,
}

pub struct TunnelSupervisor<C: Clock> {
    cfg: Arc<dyn ConfigHandle>,
    ssh: Arc<dyn SshOps>,
    clock: C,
    run_dir: PathBuf,
    /// Cached `@/cloud/service/` properties.
    props: Mutex<HashMap<String, String>>,
    /// Changes delivered by watch callbacks, ingested on the next tick.
    pending: Arc<Mutex<VecDeque<(String, Option<String>)>>>,
}

impl<C: Clock> TunnelSupervisor<C> {
    pub fn new(
        cfg: Arc<dyn ConfigHandle>,
        ssh: Arc<dyn SshOps>,
        run_dir: PathBuf,
        clock: C,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            ssh,
            clock,
            run_dir,
            props: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    /// Register the property watches; callbacks only enqueue.
    pub async fn register_watches(&self) -> Result<(), CfgError> {
        let pattern = format!("^{PROP_BASE}/.*");
        let pending = Arc::clone(&self.pending);
        self.cfg
            .handle_change(
                &pattern,
                Arc::new(move |prop, value| {
                    pending.lock().push_back((prop.to_string(), value.map(String::from)));
                }),
            )
            .await?;
        let pending = Arc::clone(&self.pending);
        self.cfg
            .handle_delete(
                &pattern,
                Arc::new(move |prop, _| {
                    pending.lock().push_back((prop.to_string(), None));
                }),
            )
            .await?;
        let pending = Arc::clone(&self.pending);
        self.cfg
            .handle_expire(
                &pattern,
                Arc::new(move |prop, _| {
                    pending.lock().push_back((prop.to_string(), None));
                }),
            )
            .await?;
        Ok(())
    }

    /// Prime the cache from the tree so a restart with live properties
    /// brings the tunnel back up.
    pub async fn prime(&self) {
        if let Ok(node) = self.cfg.get_props(PROP_BASE).await {
            let mut props = self.props.lock();
            for (key, child) in &node.children {
                if let Some(value) = &child.value {
                    props.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Pull pending property changes into the cache. Returns the set of
    /// changed keys.
    fn ingest(&self) -> Vec<String> {
        let mut changed = Vec::new();
        let mut pending = self.pending.lock();
        let mut props = self.props.lock();
        while let Some((prop, value)) = pending.pop_front() {
            let Some(key) = prop.strip_prefix(PROP_BASE).map(|k| k.trim_start_matches('/'))
            else {
                continue;
            };
            let key = key.to_string();
            match value {
                Some(value) => props.insert(key.clone(), value),
                None => props.remove(&key),
            };
            changed.push(key);
        }
        changed
    }

    fn want_open(&self) -> bool {
        let props = self.props.lock();
        NEEDED_KEYS.iter().all(|k| props.get(*k).map(|v| !v.is_empty()).unwrap_or(false))
    }

    fn prop(&self, key: &str) -> Option<String> {
        self.props.lock().get(key).cloned()
    }

    /// One reconcile pass.
    async fn tick(&self, machine: &mut Machine) {
        let changed = self.ingest();
        let want_open = self.want_open();
        // Only cloud-authored keys cycle the tunnel; our own published
        // tunnel_user_key changes every time we open one.
        let key_changed = changed
            .iter()
            .any(|k| matches!(k.as_str(), KEY_CLOUD_HOST_KEY | KEY_CLOUD_USER_KEY));

        // Re-authorize the operator key when it changes (empty = revoke).
        if changed.iter().any(|k| k == KEY_CLOUD_USER_KEY) {
            let key = self.prop(KEY_CLOUD_USER_KEY);
            if let Err(e) = self.ssh.authorize(&self.run_dir, key.as_deref()).await {
                warn!(error = %e, "failed to update authorized key");
            }
        }

        // Close the tunnel when it is no longer wanted or keys rotated.
        if (!want_open || key_changed) && machine.tunnel.is_some() {
            if let Some(tunnel) = machine.tunnel.take() {
                tunnel.close().await;
            }
        }

        // Daemon update.
        if want_open {
            if let Some(daemon) = machine.daemon.as_mut() {
                if !daemon.alive() {
                    warn!("service sshd died, relaunching");
                    machine.daemon = None;
                    machine.next_daemon_attempt = None;
                }
            }
            if machine.daemon.is_none()
                && machine.next_daemon_attempt.map(|t| self.clock.now() >= t).unwrap_or(true)
            {
                let key = self.prop(KEY_CLOUD_USER_KEY);
                match self.ssh.spawn_sshd(&self.run_dir, key.as_deref()).await {
                    Ok(daemon) => {
                        machine.daemon = Some(daemon);
                        machine.next_daemon_attempt = None;
                    }
                    Err(e) => {
                        warn!(error = %e, "sshd spawn failed, backing off");
                        machine.next_daemon_attempt = Some(self.clock.now() + DAEMON_RETRY);
                    }
                }
            }
        } else if let Some(daemon) = machine.daemon.take() {
            daemon.finalize().await;
        }

        // Tunnel update.
        if let Some(tunnel) = machine.tunnel.as_mut() {
            if !tunnel.alive() {
                warn!("service tunnel died");
                machine.tunnel = None;
            }
        }
        let daemon_alive = machine.daemon.as_mut().map(|d| d.alive()).unwrap_or(false);
        if want_open
            && daemon_alive
            && machine.tunnel.is_none()
            && machine.next_tunnel_attempt.map(|t| self.clock.now() >= t).unwrap_or(true)
        {
            match self.open_tunnel(machine).await {
                Ok(tunnel) => {
                    machine.tunnel = Some(tunnel);
                    machine.next_tunnel_attempt = None;
                    info!("service tunnel established");
                }
                Err(e) => {
                    warn!(error = %e, "tunnel open failed, backing off");
                    machine.next_tunnel_attempt = Some(self.clock.now() + TUNNEL_RETRY);
                }
            }
        }
    }

    /// Generate a fresh user key, publish its public half with the
    /// tunnel lifetime, then open the tunnel.
    async fn open_tunnel(&self, machine: &mut Machine) -> std::io::Result<Box<dyn SshTunnel>> {
        let local_port =
            machine.daemon.as_ref().map(|d| d.port()).ok_or_else(|| {
                std::io::Error::other("no local sshd")
            })?;
        let (host, user, host_key, port) = {
            let props = self.props.lock();
            (
                props.get(KEY_CLOUD_HOST).cloned().unwrap_or_default(),
                props.get(KEY_CLOUD_USER).cloned().unwrap_or_default(),
                props.get(KEY_CLOUD_HOST_KEY).cloned().unwrap_or_default(),
                props.get(KEY_TUNNEL_PORT).cloned().unwrap_or_default(),
            )
        };
        let remote_port: u16 = port
            .parse()
            .map_err(|_| std::io::Error::other(format!("bad tunnel_port {port:?}")))?;

        let (identity, public_key) = self.ssh.generate_keypair(&self.run_dir).await?;
        let expires = self.clock.wall()
            + chrono::Duration::from_std(TUNNEL_LIFETIME)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.cfg
            .execute(&[CfgOp::set(format!("{PROP_BASE}/{KEY_TUNNEL_USER_KEY}"), &public_key)
                .with_expires(expires)])
            .await
            .map_err(|e| std::io::Error::other(format!("publishing tunnel key: {e}")))?;

        let spec = TunnelSpec {
            local_port,
            cloud_user: user,
            cloud_host: host,
            cloud_host_key: host_key,
            remote_port,
            identity,
        };
        self.ssh.open_tunnel(&self.run_dir, &spec).await
    }

    /// Supervisor loop: 1 s reconcile tick until shutdown.
    pub async fn run(self: Arc<Self>, mut done: mpsc::Receiver<bool>) {
        self.prime().await;
        let mut machine = Machine::default();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done.recv() => break,
                _ = tick.tick() => {}
            }
            self.tick(&mut machine).await;
        }
        // Shutdown: close tunnel, stop the daemon, drop key material.
        if let Some(tunnel) = machine.tunnel.take() {
            tunnel.close().await;
        }
        if let Some(daemon) = machine.daemon.take() {
            daemon.finalize().await;
        }
        self.ssh.remove_key_material(&self.run_dir).await;
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
