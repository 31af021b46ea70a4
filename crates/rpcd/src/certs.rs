// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Certificate lifecycle: keep exactly one unexpired cloud-origin
//! certificate installed, react to availability and expiry, and fall
//! back to a self-signed certificate when nothing else is left.

use crate::cloud_api::CloudClient;
use ap_core::certs::{CertFingerprint, CertOrigin, CertState};
use ap_core::config::CfgOp;
use ap_core::{CfgError, Clock, ConfigHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Retry delays, in seconds. The final entry repeats forever.
pub const RETRY_SCHEDULE: [u64; 18] =
    [1, 2, 2, 5, 5, 15, 15, 15, 60, 60, 60, 60, 300, 300, 900, 900, 900, 3600];

/// After a successful install, don't bother the server again for a day.
const RECHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const CERTS_SUBTREE: &str = "@/certs";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("download failed: {0}")]
    Download(#[from] tonic::Status),

    #[error("server returned unusable certificate: {0}")]
    BadCert(String),

    #[error("install failed: {0}")]
    Install(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] CfgError),
}

/// Platform piece that atomically replaces the served key/cert files and
/// notifies consumers.
#[async_trait]
pub trait CertInstaller: Send + Sync {
    async fn install(&self, key: &[u8], cert: &[u8], issuer: &[u8]) -> std::io::Result<()>;
}

/// Writes PEM material under the secret directory with temp+rename.
/// Consumers watch the config tree, so publication there is the
/// notification.
pub struct FsInstaller {
    ssl_dir: PathBuf,
}

impl FsInstaller {
    pub fn new(ssl_dir: PathBuf) -> Self {
        Self { ssl_dir }
    }
}

#[async_trait]
impl CertInstaller for FsInstaller {
    async fn install(&self, key: &[u8], cert: &[u8], issuer: &[u8]) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.ssl_dir)?;
        for (file, body) in
            [("private.key", key), ("cert.pem", cert), ("issuer.pem", issuer)]
        {
            let target = self.ssl_dir.join(file);
            let tmp = target.with_extension("tmp");
            std::fs::write(&tmp, body)?;
            std::fs::rename(&tmp, &target)?;
        }
        Ok(())
    }
}

/// What a cert-watch callback saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertEvent {
    /// `@/certs/<fp>/state` became `available`.
    Available(CertFingerprint),
    /// A cert subtree's state expired.
    Expired(CertFingerprint),
}

/// Outcome of one controller pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Server fingerprint matched ours; nothing to do.
    UpToDate,
    Installed,
}

pub struct CertController<C: Clock> {
    cloud: Arc<dyn CloudClient>,
    cfg: Arc<dyn ConfigHandle>,
    installer: Arc<dyn CertInstaller>,
    clock: C,
    pending: Arc<Mutex<VecDeque<CertEvent>>>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl<C: Clock> CertController<C> {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        cfg: Arc<dyn ConfigHandle>,
        installer: Arc<dyn CertInstaller>,
        clock: C,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Arc::new(Self {
            cloud,
            cfg,
            installer,
            clock,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
        })
    }

    /// Register the `@/certs/*/state` watches. Callbacks only enqueue.
    pub async fn register_watches(&self) -> Result<(), CfgError> {
        let pattern = r"^@/certs/[0-9a-f]+/state$";
        let pending = Arc::clone(&self.pending);
        let wake = self.wake_tx.clone();
        self.cfg
            .handle_change(
                pattern,
                Arc::new(move |prop, value| {
                    if value == Some("available") {
                        if let Some(fp) = fingerprint_of_path(prop) {
                            pending.lock().push_back(CertEvent::Available(fp));
                            let _ = wake.try_send(());
                        }
                    }
                }),
            )
            .await?;
        let pending = Arc::clone(&self.pending);
        let wake = self.wake_tx.clone();
        self.cfg
            .handle_expire(
                pattern,
                Arc::new(move |prop, _| {
                    if let Some(fp) = fingerprint_of_path(prop) {
                        pending.lock().push_back(CertEvent::Expired(fp));
                        let _ = wake.try_send(());
                    }
                }),
            )
            .await?;
        Ok(())
    }

    /// The currently-installed, unexpired, cloud-origin certificate.
    async fn installed_cloud_cert(&self) -> Option<CertFingerprint> {
        let certs = self.cfg.get_props(CERTS_SUBTREE).await.ok()?;
        let now = self.clock.wall();
        for (fp, node) in &certs.children {
            let state = node.child_value("state").and_then(|s| s.parse::<CertState>().ok());
            let origin = node.child_value("origin").map(CertOrigin::parse);
            let expired = node
                .child("state")
                .and_then(|n| n.expires)
                .map(|e| e <= now)
                .unwrap_or(false);
            if state == Some(CertState::Installed)
                && origin == Some(CertOrigin::Cloud)
                && !expired
            {
                if let Ok(fp) = fp.parse() {
                    return Some(fp);
                }
            }
        }
        None
    }

    /// One scheduled pass: ask the server for our current fingerprint and
    /// install whatever newer cert it hands back.
    pub async fn tick(&self) -> Result<TickOutcome, CertError> {
        let installed = self.installed_cloud_cert().await;
        self.download_and_install(installed).await
    }

    async fn download_and_install(
        &self,
        have: Option<CertFingerprint>,
    ) -> Result<TickOutcome, CertError> {
        let requested = have.map(|fp| fp.as_bytes().to_vec()).unwrap_or_default();
        let resp = self.cloud.cert_download(requested.clone()).await?;
        if !requested.is_empty() && resp.fingerprint == requested {
            return Ok(TickOutcome::UpToDate);
        }
        let fp_bytes: [u8; 20] = resp
            .fingerprint
            .clone()
            .try_into()
            .map_err(|_| CertError::BadCert("fingerprint is not 20 bytes".to_string()))?;
        let fp = CertFingerprint::new(fp_bytes);
        if resp.key.is_empty() || resp.certificate.is_empty() {
            return Err(CertError::BadCert("empty key or certificate".to_string()));
        }

        self.installer.install(&resp.key, &resp.certificate, &resp.issuer_cert).await?;
        let expires = resp.expiration.as_ref().and_then(crate::ptime::from_proto);
        self.record_install(fp, CertOrigin::Cloud, expires).await?;

        if let Some(old) = have {
            if old != fp {
                self.cfg.delete_prop(&format!("{CERTS_SUBTREE}/{old}")).await?;
            }
        }
        info!(fingerprint = %fp, "certificate installed");
        Ok(TickOutcome::Installed)
    }

    async fn record_install(
        &self,
        fp: CertFingerprint,
        origin: CertOrigin,
        expires: Option<DateTime<Utc>>,
    ) -> Result<(), CfgError> {
        let base = format!("{CERTS_SUBTREE}/{fp}");
        let mut state_op = CfgOp::create(format!("{base}/state"), CertState::Installed.to_string());
        if let Some(expires) = expires {
            state_op = state_op.with_expires(expires);
        }
        self.cfg
            .execute(&[state_op, CfgOp::create(format!("{base}/origin"), origin.as_str())])
            .await?;
        Ok(())
    }

    /// Handle one queued watch event.
    pub async fn handle_event(&self, event: CertEvent) -> Result<(), CertError> {
        match event {
            CertEvent::Available(fp) => {
                // The cloud told us a specific replacement is staged.
                let resp = self.cloud.cert_download(fp.as_bytes().to_vec()).await?;
                if resp.key.is_empty() || resp.certificate.is_empty() {
                    return Err(CertError::BadCert("empty key or certificate".to_string()));
                }
                self.installer.install(&resp.key, &resp.certificate, &resp.issuer_cert).await?;
                let old = self.installed_cloud_cert().await;
                let expires = resp.expiration.as_ref().and_then(crate::ptime::from_proto);
                self.record_install(fp, CertOrigin::Cloud, expires).await?;
                if let Some(old) = old {
                    if old != fp {
                        self.cfg.delete_prop(&format!("{CERTS_SUBTREE}/{old}")).await?;
                    }
                }
                info!(fingerprint = %fp, "available certificate installed");
                Ok(())
            }
            CertEvent::Expired(fp) => {
                self.cfg.delete_prop(&format!("{CERTS_SUBTREE}/{fp}")).await?;
                if self.installed_cloud_cert().await.is_none() {
                    match self.generate_self_signed().await {
                        // A cloud cert raced us into the tree: that's a win.
                        Err(CfgError::NotEqual) => {
                            info!("cloud certificate arrived during self-signed generation");
                            Ok(())
                        }
                        Err(e) => Err(e.into()),
                        Ok(()) => Ok(()),
                    }
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Fallback generator so daemons that need *a* certificate keep
    /// working. Returns `NotEqual` if a cloud cert appeared meanwhile.
    async fn generate_self_signed(&self) -> Result<(), CfgError> {
        let certified = rcgen::generate_simple_self_signed(vec!["appliance.local".to_string()])
            .map_err(|e| CfgError::BadProp(format!("self-signed generation: {e}")))?;
        let cert_pem = certified.cert.pem();
        let key_pem = certified.key_pair.serialize_pem();
        let fp = CertFingerprint::of_der(certified.cert.der());

        if self.installed_cloud_cert().await.is_some() {
            return Err(CfgError::NotEqual);
        }
        self.installer
            .install(key_pem.as_bytes(), cert_pem.as_bytes(), &[])
            .await
            .map_err(|e| CfgError::Comm(e.to_string()))?;
        let expires = self.clock.wall() + chrono::Duration::days(365);
        self.record_install(fp, CertOrigin::SelfSigned, Some(expires)).await?;
        info!(fingerprint = %fp, "self-signed fallback certificate installed");
        Ok(())
    }

    /// Controller loop: drain watch events, then run the scheduled pass,
    /// backing off along [`RETRY_SCHEDULE`] on failure.
    pub async fn run(self: Arc<Self>, mut done: mpsc::Receiver<bool>) {
        let mut wake = match self.wake_rx.lock().take() {
            Some(wake) => wake,
            None => {
                // Second run() call; nothing sensible to do with events.
                warn!("cert controller already running");
                return;
            }
        };
        let mut retry_idx = 0usize;
        loop {
            let event = self.pending.lock().pop_front();
            if let Some(event) = event {
                if let Err(e) = self.handle_event(event.clone()).await {
                    warn!(?event, error = %e, "cert event handling failed");
                }
                continue;
            }

            let sleep = match self.tick().await {
                Ok(_) => {
                    retry_idx = 0;
                    RECHECK_INTERVAL
                }
                Err(e) => {
                    warn!(error = %e, "certificate pass failed");
                    let delay = RETRY_SCHEDULE[retry_idx.min(RETRY_SCHEDULE.len() - 1)];
                    retry_idx = (retry_idx + 1).min(RETRY_SCHEDULE.len() - 1);
                    Duration::from_secs(delay)
                }
            };
            tokio::select! {
                _ = done.recv() => return,
                _ = wake.recv() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

/// `@/certs/<fp>/state` → fingerprint.
fn fingerprint_of_path(prop: &str) -> Option<CertFingerprint> {
    prop.strip_prefix("@/certs/")?.strip_suffix("/state")?.parse().ok()
}

#[cfg(test)]
#[path = "certs_tests.rs"]
mod tests;
