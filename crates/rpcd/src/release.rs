// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Release controller: stage a target release, verify every artifact,
//! hand it to the platform installer, and report the outcome.

use crate::cloud_api::CloudClient;
use crate::uploaders::faults::write_fault;
use crate::uploaders::EventSender;
use ap_cloud::cloud_rpc;
use ap_core::platform::PlatformError;
use ap_core::{is_random_serial, Clock, ConfigHandle, Platform, ReleaseDescriptor, ReleaseError};
use futures_util::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Well-known artifact filenames and what the installer expects them to
/// be called. An empty target skips the artifact; filenames not listed
/// here are kept verbatim.
const ARTIFACT_NAME_MAP: &[(&str, &str)] = &[
    ("uImage.itb", "uImage"),
    ("root.squashfs", "rootfs.img"),
    ("metadata.json", ""),
];

#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Target matches the running release. Logged, never reported.
    #[error("target release matches running release")]
    SameRelease,

    #[error("descriptor fetch failed: {0}")]
    Fetch(#[from] tonic::Status),

    #[error(transparent)]
    Descriptor(#[from] ReleaseError),

    #[error("artifact {filename} download failed: {source}")]
    Download { filename: String, source: reqwest::Error },

    #[error("artifact {filename} hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { filename: String, expected: String, actual: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

pub struct ReleaseController<C: Clock> {
    cloud: Arc<dyn CloudClient>,
    sender: EventSender,
    cfg: Arc<dyn ConfigHandle>,
    platform: Arc<dyn Platform>,
    http: reqwest::Client,
    /// Staging area: `<data>/release/<uuid>/…`
    release_root: PathBuf,
    /// Descriptor of the running release, maintained by the installer.
    current_descriptor: PathBuf,
    versions_dir: PathBuf,
    fault_spool: PathBuf,
    update_bucket: Arc<Mutex<String>>,
    clock: C,
}

impl<C: Clock + 'static> ReleaseController<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        sender: EventSender,
        cfg: Arc<dyn ConfigHandle>,
        platform: Arc<dyn Platform>,
        release_root: PathBuf,
        current_descriptor: PathBuf,
        versions_dir: PathBuf,
        fault_spool: PathBuf,
        update_bucket: Arc<Mutex<String>>,
        clock: C,
    ) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            sender,
            cfg,
            platform,
            http: reqwest::Client::new(),
            release_root,
            current_descriptor,
            versions_dir,
            fault_spool,
            update_bucket,
            clock,
        })
    }

    /// UUID of the release this appliance is currently running.
    fn current_release(&self) -> Option<Uuid> {
        let raw = std::fs::read_to_string(&self.current_descriptor).ok()?;
        ReleaseDescriptor::from_json(&raw).ok().map(|d| d.release_uuid)
    }

    /// Watch `@/nodes/<node>/target_release`; the callback only nudges
    /// the controller loop.
    pub async fn register_watch(self: Arc<Self>) -> Result<(), ap_core::CfgError> {
        let node = match self.platform.node_id() {
            Ok(node) => node,
            Err(e) => {
                warn!(error = %e, "no node ID, release watch disabled");
                return Ok(());
            }
        };
        let (tx, rx) = mpsc::channel(1);
        let pattern = format!("^@/nodes/{}/target_release$", regex::escape(&node));
        self.cfg
            .handle_change(
                &pattern,
                Arc::new(move |_, _| {
                    let _ = tx.try_send(());
                }),
            )
            .await?;
        tokio::spawn(self.watch_loop(rx));
        Ok(())
    }

    async fn watch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            self.run_upgrade().await;
        }
    }

    /// Publish the startup `REPORT` with the running release and its
    /// commit map, plus a `SerialException` for self-assigned serials.
    pub async fn report_startup(&self) {
        let current = self.current_release();
        let commits = read_commit_map(&self.versions_dir);
        let report = cloud_rpc::UpgradeReport {
            time: Some(crate::ptime::to_proto(self.clock.wall())),
            result: cloud_rpc::upgrade_report::Result::Report as i32,
            release_uuid: current.map(|u| u.to_string()).unwrap_or_default(),
            output: String::new(),
            error: String::new(),
            commits,
        };
        if let Err(e) = self.sender.put("upgrade", "UpgradeReport", &report).await {
            warn!(error = %e, "startup release report failed");
        }

        if let Ok(node) = self.platform.node_id() {
            if is_random_serial(&node) {
                let exception = cloud_rpc::SerialException {
                    time: Some(crate::ptime::to_proto(self.clock.wall())),
                    serial: node,
                };
                if let Err(e) = self.sender.put("exception", "SerialException", &exception).await {
                    warn!(error = %e, "serial exception report failed");
                }
            }
        }
    }

    /// Full upgrade pass, including outcome reporting.
    pub async fn run_upgrade(&self) {
        match self.upgrade().await {
            Ok((uuid, output)) => {
                self.report(cloud_rpc::upgrade_report::Result::Success, &uuid.to_string(), output, None)
                    .await;
                if self.platform.root() == Path::new("/") {
                    info!("upgrade staged, requesting reboot");
                    if let Err(e) = self.platform.reboot().await {
                        warn!(error = %e, "reboot request failed");
                    }
                } else {
                    info!(root = %self.platform.root().display(), "non-production root, skipping reboot");
                }
            }
            Err(UpgradeError::SameRelease) => {
                info!("target release already running");
            }
            Err(e) => {
                warn!(error = %e, "upgrade failed");
                let body = serde_json::json!({ "kind": "upgrade", "error": e.to_string() });
                if let Err(fault_err) = write_fault(
                    &self.fault_spool,
                    "upgrade",
                    self.clock.wall(),
                    body.to_string().as_bytes(),
                ) {
                    warn!(error = %fault_err, "failed to spool upgrade fault");
                }
                self.report(
                    cloud_rpc::upgrade_report::Result::Failure,
                    "",
                    String::new(),
                    Some(e.to_string()),
                )
                .await;
            }
        }
    }

    async fn report(
        &self,
        result: cloud_rpc::upgrade_report::Result,
        uuid: &str,
        output: String,
        error: Option<String>,
    ) {
        let report = cloud_rpc::UpgradeReport {
            time: Some(crate::ptime::to_proto(self.clock.wall())),
            result: result as i32,
            release_uuid: uuid.to_string(),
            output,
            error: error.unwrap_or_default(),
            commits: HashMap::new(),
        };
        if let Err(e) = self.sender.put("upgrade", "UpgradeReport", &report).await {
            warn!(error = %e, "upgrade report failed");
        }
    }

    /// Fetch, stage, verify, and install the target release. Returns the
    /// new UUID and the installer's output.
    async fn upgrade(&self) -> Result<(Uuid, String), UpgradeError> {
        let raw = self.cloud.fetch_descriptor().await?;
        let descriptor = ReleaseDescriptor::from_json(&raw)?;
        let target = descriptor.release_uuid;

        if Some(target) == self.current_release() {
            return Err(UpgradeError::SameRelease);
        }
        descriptor.validate(self.platform.platform_name())?;

        let stage = self.release_root.join(target.to_string());
        std::fs::create_dir_all(&stage)?;
        let pretty = serde_json::to_string_pretty(&descriptor)
            .map_err(|e| UpgradeError::Descriptor(ReleaseError::BadJson(e)))?;
        std::fs::write(stage.join("release.json"), pretty)?;

        for artifact in &descriptor.artifacts {
            let Some(target_name) = map_artifact_name(&artifact.filename) else {
                info!(filename = %artifact.filename, "artifact not needed on this platform");
                continue;
            };
            let url = self.resolve_url(&artifact.url);
            self.download_artifact(&url, &stage.join(target_name), &artifact.hash_hex, &artifact.filename)
                .await?;
        }

        let output = self.platform.upgrade(&stage).await?;
        self.prune_releases(self.current_release(), target);
        info!(release = %target, "upgrade installed");
        Ok((target, output))
    }

    /// Relative artifact paths are served out of the update bucket.
    fn resolve_url(&self, url: &str) -> String {
        if url.contains("://") {
            return url.to_string();
        }
        let bucket = self.update_bucket.lock().clone();
        if bucket.is_empty() {
            url.to_string()
        } else {
            format!("{}/{}", bucket.trim_end_matches('/'), url.trim_start_matches('/'))
        }
    }

    /// Stream the body into `<final>.tmp`, hashing as we go; rename only
    /// on a digest match.
    async fn download_artifact(
        &self,
        url: &str,
        final_path: &Path,
        expected_hex: &str,
        filename: &str,
    ) -> Result<(), UpgradeError> {
        let wrap = |source: reqwest::Error| UpgradeError::Download {
            filename: filename.to_string(),
            source,
        };
        let resp = self.http.get(url).send().await.map_err(wrap)?.error_for_status().map_err(wrap)?;

        let tmp = tmp_path(final_path);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(wrap)?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected_hex) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(UpgradeError::HashMismatch {
                filename: filename.to_string(),
                expected: expected_hex.to_string(),
                actual,
            });
        }
        tokio::fs::rename(&tmp, final_path).await?;
        Ok(())
    }

    /// Drop staged releases other than the running one and the new target.
    fn prune_releases(&self, current: Option<Uuid>, target: Uuid) {
        let Ok(iter) = std::fs::read_dir(&self.release_root) else { return };
        for entry in iter.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(uuid) = Uuid::parse_str(name) else { continue };
            if uuid == target || Some(uuid) == current {
                continue;
            }
            if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                warn!(release = %uuid, error = %e, "failed to prune staged release");
            }
        }
    }
}

/// Installer name for a descriptor filename, `None` to skip.
fn map_artifact_name(filename: &str) -> Option<&str> {
    for (from, to) in ARTIFACT_NAME_MAP {
        if *from == filename {
            return if to.is_empty() { None } else { Some(to) };
        }
    }
    Some(filename)
}

/// Package→commit mappings, reduced per repository: a repo whose packages
/// all share one commit collapses to a single `repo` entry; otherwise
/// each `repo:package` reports individually. Missing directory = empty.
fn read_commit_map(versions_dir: &Path) -> HashMap<String, String> {
    let mut by_repo: HashMap<String, Vec<(String, String)>> = HashMap::new();
    let Ok(iter) = std::fs::read_dir(versions_dir) else { return HashMap::new() };
    for entry in iter.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Ok(commit) = std::fs::read_to_string(entry.path()) else { continue };
        let commit = commit.trim().to_string();
        if commit.is_empty() {
            continue;
        }
        let (repo, package) = name.split_once(':').unwrap_or((name, ""));
        by_repo.entry(repo.to_string()).or_default().push((package.to_string(), commit));
    }

    let mut out = HashMap::new();
    for (repo, packages) in by_repo {
        let first = &packages[0].1;
        if packages.iter().all(|(_, commit)| commit == first) {
            out.insert(repo, first.clone());
        } else {
            for (package, commit) in packages {
                out.insert(format!("{repo}:{package}"), commit);
            }
        }
    }
    out
}

/// `.tmp` sibling of the final artifact path.
fn tmp_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    final_path.with_file_name(name)
}

#[cfg(test)]
#[path = "release_tests.rs"]
mod tests;
