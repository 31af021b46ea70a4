// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Platform abstraction: the appliance-specific surface the daemon
//! depends on but does not own.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Well-known directory roots resolvable through the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirTag {
    /// Persistent appliance data (`<root>/var/spool`).
    Data,
    /// Secret material (`<root>/etc/secret`).
    Secret,
    /// Runtime state (`<root>/var/run`).
    Run,
}

/// Daemon state reported to the master control program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Ok,
    Broken,
}

crate::simple_display! {
    SupervisorState {
        Ok => "OK",
        Broken => "BROKEN",
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("node ID unavailable: {0}")]
    NoNodeId(String),

    #[error("upgrade invocation failed: {0}")]
    Upgrade(String),

    #[error("reboot request failed: {0}")]
    Reboot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The appliance platform surface.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Kernel boot time, sampled once at startup.
    fn boot_time(&self) -> DateTime<Utc>;

    /// The appliance's persisted node identifier.
    fn node_id(&self) -> Result<String, PlatformError>;

    /// Hardware platform name (`mt7623`, `rpi3`, `x86`, …).
    fn platform_name(&self) -> &str;

    /// Filesystem root the platform is installed under (`/` in production).
    fn root(&self) -> &Path;

    /// Expand a well-known directory tag plus a relative path.
    fn expand_dir_path(&self, tag: DirTag, rest: &str) -> PathBuf;

    /// Run the platform upgrade against a staged release directory,
    /// returning combined stdout+stderr.
    async fn upgrade(&self, release_dir: &Path) -> Result<String, PlatformError>;

    /// Request an appliance reboot through the supervisor.
    async fn reboot(&self) -> Result<(), PlatformError>;
}

/// True if `node_id` looks like a self-assigned (random v4 UUID) serial
/// rather than a factory-programmed one.
pub fn is_random_serial(node_id: &str) -> bool {
    match Uuid::parse_str(node_id) {
        Ok(uuid) => uuid.get_version() == Some(uuid::Version::Random),
        Err(_) => false,
    }
}

/// Production platform backed by procfs and the appliance filesystem.
pub struct LinuxPlatform {
    root: PathBuf,
    name: String,
    boot_time: DateTime<Utc>,
}

impl LinuxPlatform {
    /// Probe the platform under `root`. Boot time is sampled here, once.
    pub fn probe(root: PathBuf) -> Self {
        let boot_time = read_boot_time("/proc/stat").unwrap_or_else(Utc::now);
        let name = std::fs::read_to_string(root.join("etc/platform"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "x86".to_string());
        Self { root, name, boot_time }
    }
}

#[async_trait]
impl Platform for LinuxPlatform {
    fn boot_time(&self) -> DateTime<Utc> {
        self.boot_time
    }

    fn node_id(&self) -> Result<String, PlatformError> {
        let path = self.root.join("etc/nodeid");
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| PlatformError::NoNodeId(format!("{}: {e}", path.display())))?;
        let id = raw.trim();
        if id.is_empty() {
            return Err(PlatformError::NoNodeId(format!("{} is empty", path.display())));
        }
        Ok(id.to_string())
    }

    fn platform_name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn expand_dir_path(&self, tag: DirTag, rest: &str) -> PathBuf {
        let base = match tag {
            DirTag::Data => self.root.join("var/spool"),
            DirTag::Secret => self.root.join("etc/secret"),
            DirTag::Run => self.root.join("var/run"),
        };
        base.join(rest)
    }

    async fn upgrade(&self, release_dir: &Path) -> Result<String, PlatformError> {
        let script = self.root.join("bin/ap-upgrade");
        let output = tokio::process::Command::new(&script)
            .arg(release_dir)
            .output()
            .await
            .map_err(|e| PlatformError::Upgrade(format!("{}: {e}", script.display())))?;
        let mut blob = String::from_utf8_lossy(&output.stdout).into_owned();
        blob.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(blob)
        } else {
            Err(PlatformError::Upgrade(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                blob
            )))
        }
    }

    async fn reboot(&self) -> Result<(), PlatformError> {
        let status = tokio::process::Command::new(self.root.join("bin/ap-reboot"))
            .status()
            .await
            .map_err(|e| PlatformError::Reboot(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(PlatformError::Reboot(format!("exit {}", status.code().unwrap_or(-1))))
        }
    }
}

/// Parse the kernel boot time (`btime` line) from a procfs stat file.
fn read_boot_time(stat_path: &str) -> Option<DateTime<Utc>> {
    let stat = std::fs::read_to_string(stat_path).ok()?;
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            let secs: i64 = rest.trim().parse().ok()?;
            return Utc.timestamp_opt(secs, 0).single();
        }
    }
    None
}

#[cfg(test)]
#[path = "platform_tests.rs"]
mod tests;
