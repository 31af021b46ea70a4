// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fault-report shipping and spool retention.
//!
//! Fault files are written by whichever subsystem noticed the problem;
//! this loop ships them verbatim and keeps the spool bounded: at most
//! [`MAX_RETAIN`] files overall, uploaded files kept at most 72 hours.

use super::publish::{EventSender, PublishError};
use crate::ptime;
use ap_cloud::cloud_rpc;
use ap_core::{Clock, FaultFileName};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const MAX_RETAIN: usize = 100;
pub const UPLOADED_MAX_AGE_HOURS: i64 = 72;

const FAULT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FaultError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// The work list for one pass over the spool.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SpoolPlan {
    /// Files to delete. May contain duplicates when a file qualifies for
    /// both the count cap and the age purge; deletion is idempotent.
    pub reap: Vec<PathBuf>,
    pub upload: Vec<PathBuf>,
}

/// Decide what to reap and what to upload.
pub fn plan(spool: &[(PathBuf, FaultFileName)], now: DateTime<Utc>, forced: bool) -> SpoolPlan {
    let mut sorted: Vec<&(PathBuf, FaultFileName)> = spool.iter().collect();
    sorted.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp));

    let mut plan = SpoolPlan::default();

    // Over the global cap: evict oldest first.
    if sorted.len() > MAX_RETAIN {
        for (path, _) in sorted.iter().take(sorted.len() - MAX_RETAIN) {
            plan.reap.push(path.clone());
        }
    }
    for (path, name) in &sorted {
        if name.uploaded && now - name.timestamp > chrono::Duration::hours(UPLOADED_MAX_AGE_HOURS) {
            plan.reap.push(path.clone());
        }
        if !name.uploaded || forced {
            plan.upload.push(path.clone());
        }
    }
    plan
}

pub struct FaultUploader<C: Clock> {
    sender: EventSender,
    spool_dir: PathBuf,
    clock: C,
}

impl<C: Clock> FaultUploader<C> {
    pub fn new(sender: EventSender, spool_dir: PathBuf, clock: C) -> Self {
        Self { sender, spool_dir, clock }
    }

    fn scan(&self) -> Result<Vec<(PathBuf, FaultFileName)>, FaultError> {
        let iter = match std::fs::read_dir(&self.spool_dir) {
            Ok(iter) => iter,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(iter
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|p| FaultFileName::parse_path(&p).map(|n| (p, n)))
            .collect())
    }

    /// One pass: ship what needs shipping, then prune.
    pub async fn upload(&self, forced: bool) -> Result<(), FaultError> {
        let spool = self.scan()?;
        let plan = plan(&spool, self.clock.wall(), forced);

        for path in &plan.upload {
            let Some(name) = FaultFileName::parse_path(path) else { continue };
            let content = match std::fs::read(path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable fault file");
                    continue;
                }
            };
            let report = cloud_rpc::FaultReport {
                time: Some(ptime::to_proto(name.timestamp)),
                kind: name.kind.clone(),
                content,
            };
            match self.sender.put("fault", "FaultReport", &report).await {
                Ok(()) => {
                    if !name.uploaded {
                        let renamed = path.with_file_name(name.as_uploaded().file_name());
                        if let Err(e) = std::fs::rename(path, &renamed) {
                            warn!(path = %path.display(), error = %e, "failed to mark fault uploaded");
                        }
                    }
                }
                // Leave the file for the next cycle.
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "fault upload failed");
                    break;
                }
            }
        }

        for path in &plan.reap {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "reaped fault file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to reap fault file"),
            }
        }
        Ok(())
    }

    pub async fn run(self, mut done: mpsc::Receiver<bool>) {
        let mut tick = tokio::time::interval(FAULT_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done.recv() => return,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.upload(false).await {
                warn!(error = %e, "fault spool pass failed");
            }
        }
    }
}

/// Drop a fault record into the spool for later upload.
pub fn write_fault(
    spool_dir: &Path,
    kind: &str,
    timestamp: DateTime<Utc>,
    body: &[u8],
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(spool_dir)?;
    let path = spool_dir.join(FaultFileName::new(kind, timestamp).file_name());
    std::fs::write(&path, body)?;
    Ok(path)
}

#[cfg(test)]
#[path = "faults_tests.rs"]
mod tests;
