// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device-inventory upload with a manifest of already-shipped devices.
//!
//! The identifier daemon drops prost-encoded `DeviceInventory` files into
//! the spool; we batch unreported devices into `InventoryReport` events,
//! flushing whenever the accumulated message approaches the size cap. The
//! manifest maps each MAC to the time it was last uploaded and is only
//! persisted after a fully successful run.

use super::publish::{EventSender, PublishError};
use crate::ptime;
use ap_cloud::cloud_rpc;
use ap_core::{Clock, MacAddr};
use chrono::{DateTime, Utc};
use prost::Message;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Flush threshold. Comfortably below the 4 MiB gRPC frame cap even with
/// envelope overhead.
const MSG_SIZE: usize = 512 * 1024;

const INVENTORY_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("manifest malformed: {0}")]
    BadManifest(#[from] serde_json::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Manifest of `mac -> last uploaded` timestamps.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: HashMap<MacAddr, DateTime<Utc>>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let entries = serde_json::from_str(&raw)?;
        Ok(Self { entries })
    }

    /// Atomic persist: temp file in the same directory, then rename.
    pub fn store(&self, path: &Path) -> Result<(), InventoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn last_uploaded(&self, mac: MacAddr) -> Option<DateTime<Utc>> {
        self.entries.get(&mac).copied()
    }

    pub fn record(&mut self, mac: MacAddr, when: DateTime<Utc>) {
        self.entries.insert(mac, when);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct InventoryUploader<C: Clock> {
    sender: EventSender,
    spool_dir: PathBuf,
    manifest_path: PathBuf,
    clock: C,
}

impl<C: Clock> InventoryUploader<C> {
    pub fn new(sender: EventSender, spool_dir: PathBuf, manifest_path: PathBuf, clock: C) -> Self {
        Self { sender, spool_dir, manifest_path, clock }
    }

    /// One upload pass. `forced` discards the manifest and reships
    /// everything.
    pub async fn upload(&self, forced: bool) -> Result<(), InventoryError> {
        let mut manifest = if forced {
            let _ = std::fs::remove_file(&self.manifest_path);
            Manifest::default()
        } else {
            Manifest::load(&self.manifest_path)?
        };

        let mut pending: Vec<cloud_rpc::DeviceInfo> = Vec::new();
        let mut pending_macs: Vec<MacAddr> = Vec::new();
        let mut shipped = 0usize;

        let mut paths: Vec<PathBuf> = match std::fs::read_dir(&self.spool_dir) {
            Ok(iter) => iter.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        paths.sort();

        for path in paths {
            if !path.is_file() {
                continue;
            }
            let raw = match std::fs::read(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable inventory file");
                    continue;
                }
            };
            let inventory = match cloud_rpc::DeviceInventory::decode(raw.as_slice()) {
                Ok(inv) => inv,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping undecodable inventory file");
                    continue;
                }
            };
            for device in inventory.devices {
                let mac = MacAddr::from_u64(device.mac_address);
                if mac.is_zero() {
                    continue;
                }
                let Some(updated) = device.updated.as_ref().and_then(ptime::from_proto) else {
                    continue;
                };
                let fresh = forced
                    || manifest.last_uploaded(mac).map(|t| updated > t).unwrap_or(true);
                if !fresh {
                    continue;
                }
                pending.push(device);
                pending_macs.push(mac);

                let report = cloud_rpc::InventoryReport {
                    inventory: Some(cloud_rpc::DeviceInventory {
                        timestamp: Some(ptime::to_proto(self.clock.wall())),
                        devices: pending.clone(),
                    }),
                };
                if report.encoded_len() >= MSG_SIZE {
                    self.flush(&mut manifest, &mut pending, &mut pending_macs).await?;
                    shipped += 1;
                }
            }
        }
        if !pending.is_empty() {
            self.flush(&mut manifest, &mut pending, &mut pending_macs).await?;
            shipped += 1;
        }

        if shipped > 0 {
            manifest.store(&self.manifest_path)?;
            info!(reports = shipped, "inventory uploaded");
        } else {
            debug!("no inventory changes to upload");
        }
        Ok(())
    }

    async fn flush(
        &self,
        manifest: &mut Manifest,
        pending: &mut Vec<cloud_rpc::DeviceInfo>,
        pending_macs: &mut Vec<MacAddr>,
    ) -> Result<(), InventoryError> {
        let report = cloud_rpc::InventoryReport {
            inventory: Some(cloud_rpc::DeviceInventory {
                timestamp: Some(ptime::to_proto(self.clock.wall())),
                devices: std::mem::take(pending),
            }),
        };
        self.sender.put("inventory", "InventoryReport", &report).await?;
        let now = self.clock.wall();
        for mac in pending_macs.drain(..) {
            manifest.record(mac, now);
        }
        Ok(())
    }

    /// Upload on the periodic tick or when the identifier daemon nudges
    /// us over the broker.
    pub async fn run(self, mut wake: mpsc::Receiver<()>, mut done: mpsc::Receiver<bool>) {
        let mut tick = tokio::time::interval(INVENTORY_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done.recv() => return,
                _ = wake.recv() => {}
                _ = tick.tick() => {}
            }
            if let Err(e) = self.upload(false).await {
                warn!(error = %e, "inventory upload failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "inventory_tests.rs"]
mod tests;
