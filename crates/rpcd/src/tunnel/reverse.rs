// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound reverse tunnel: `ssh -R` from the cloud bastion back to the
//! local service sshd.

use super::sshd::{drain_pipe, stop_child};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::info;

/// Everything needed to open one reverse tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Local sshd the operator lands on (`127.0.0.1:<port>`).
    pub local_port: u16,
    pub cloud_user: String,
    pub cloud_host: String,
    /// Bastion host public key, pinned via a dedicated known_hosts file.
    pub cloud_host_key: String,
    /// Port forwarded on the bastion back to us.
    pub remote_port: u16,
    pub identity: PathBuf,
}

pub struct TunnelHandle {
    child: Child,
}

impl TunnelHandle {
    pub async fn open(run_dir: &Path, spec: &TunnelSpec) -> std::io::Result<Self> {
        let known_hosts = run_dir.join("known_hosts");
        tokio::fs::write(&known_hosts, format!("{} {}\n", spec.cloud_host, spec.cloud_host_key))
            .await?;

        let mut child = Command::new("ssh")
            .arg("-N")
            .arg("-T")
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=yes"])
            .arg("-o")
            .arg(format!("UserKnownHostsFile={}", known_hosts.display()))
            .args(["-o", "ExitOnForwardFailure=yes"])
            .args(["-o", "ServerAliveInterval=30"])
            .arg("-i")
            .arg(&spec.identity)
            .arg("-R")
            .arg(format!("{}:127.0.0.1:{}", spec.remote_port, spec.local_port))
            .arg(format!("{}@{}", spec.cloud_user, spec.cloud_host))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(stdout) = child.stdout.take() {
            drain_pipe(stdout, "tunnel.stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            drain_pipe(stderr, "tunnel.stderr");
        }
        info!(host = %spec.cloud_host, remote_port = spec.remote_port, "service tunnel open");
        Ok(Self { child })
    }

    pub fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub async fn close(mut self) {
        stop_child(&mut self.child, "tunnel").await;
        info!("service tunnel closed");
    }
}

/// Generate a fresh user keypair; returns the private key path and the
/// public key line.
pub async fn generate_keypair(run_dir: &Path) -> std::io::Result<(PathBuf, String)> {
    tokio::fs::create_dir_all(run_dir).await?;
    let private = run_dir.join("tunnel_user_key");
    let public = run_dir.join("tunnel_user_key.pub");
    let _ = tokio::fs::remove_file(&private).await;
    let _ = tokio::fs::remove_file(&public).await;
    let status = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", ""])
        .arg("-f")
        .arg(&private)
        .status()
        .await?;
    if !status.success() {
        return Err(std::io::Error::other("user key generation failed"));
    }
    let public_key = tokio::fs::read_to_string(&public).await?.trim().to_string();
    Ok((private, public_key))
}
