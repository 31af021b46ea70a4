// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local sshd child: templated config on a dynamically chosen loopback
//! port, pipes drained by helper tasks, TERM→KILL escalation.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const SSHD_BIN: &str = "/usr/sbin/sshd";
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Drain a child pipe so the process never blocks on a full buffer.
pub(super) fn drain_pipe<R>(reader: R, tag: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(%tag, %line, "child output");
        }
    });
}

/// TERM, wait, then KILL.
pub(super) async fn stop_child(child: &mut Child, what: &str) {
    let Some(pid) = child.id() else { return };
    let pid = Pid::from_raw(pid as i32);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        warn!(%what, error = %e, "TERM failed");
    }
    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(%what, "did not exit on TERM, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// Pick a free loopback port by binding and releasing it.
async fn free_port() -> std::io::Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

pub struct SshdHandle {
    child: Child,
    port: u16,
    run_dir: PathBuf,
}

impl SshdHandle {
    /// Spawn an sshd dedicated to the service tunnel.
    pub async fn spawn(run_dir: &Path, authorized_key: Option<&str>) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(run_dir).await?;

        let host_key = run_dir.join("host_key");
        if !host_key.exists() {
            let status = Command::new("ssh-keygen")
                .args(["-q", "-t", "ed25519", "-N", ""])
                .arg("-f")
                .arg(&host_key)
                .status()
                .await?;
            if !status.success() {
                return Err(std::io::Error::other("host key generation failed"));
            }
        }

        let authorized_keys = run_dir.join("authorized_keys");
        write_authorized_keys(run_dir, authorized_key).await?;

        let port = free_port().await?;
        let config = run_dir.join("sshd_config");
        let body = format!(
            "Port {port}\n\
             ListenAddress 127.0.0.1\n\
             HostKey {host_key}\n\
             AuthorizedKeysFile {authorized_keys}\n\
             PidFile none\n\
             PasswordAuthentication no\n\
             KbdInteractiveAuthentication no\n\
             PermitRootLogin prohibit-password\n\
             AllowTcpForwarding yes\n\
             ClientAliveInterval 30\n",
            host_key = host_key.display(),
            authorized_keys = authorized_keys.display(),
        );
        tokio::fs::write(&config, body).await?;

        let mut child = Command::new(SSHD_BIN)
            .arg("-D")
            .arg("-e")
            .arg("-f")
            .arg(&config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(stdout) = child.stdout.take() {
            drain_pipe(stdout, "sshd.stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            drain_pipe(stderr, "sshd.stderr");
        }
        info!(port, "service sshd started");
        Ok(Self { child, port, run_dir: run_dir.to_path_buf() })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the daemon and remove its key material.
    pub async fn finalize(mut self) {
        stop_child(&mut self.child, "sshd").await;
        for file in ["authorized_keys", "host_key", "host_key.pub", "sshd_config"] {
            let _ = tokio::fs::remove_file(self.run_dir.join(file)).await;
        }
        info!("service sshd stopped");
    }
}

/// Rewrite (or revoke) the authorized key the cloud operator uses.
pub async fn write_authorized_keys(run_dir: &Path, key: Option<&str>) -> std::io::Result<()> {
    let path = run_dir.join("authorized_keys");
    match key {
        Some(key) if !key.is_empty() => tokio::fs::write(&path, format!("{key}\n")).await,
        _ => match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        },
    }
}
