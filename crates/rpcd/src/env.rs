// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the daemon.

use std::path::PathBuf;
use std::time::Duration;

/// Daemon version, reported in `Hello` and written to the log on startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Platform root; `/` on a production appliance.
pub fn aproot() -> PathBuf {
    std::env::var("APROOT").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/"))
}

/// Cloud endpoint override (`host:port`), bypassing the config tree.
pub fn connection_override() -> Option<String> {
    std::env::var("B10E_CLCONFIGD_CONNECTION").ok().filter(|s| !s.is_empty())
}

/// Disable TLS on the cloud channel (development only).
pub fn tls_disabled() -> bool {
    std::env::var("B10E_CLCONFIGD_DISABLE_TLS")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Diagnostic HTTP port serving `/metrics`.
pub fn diag_port() -> u16 {
    std::env::var("B10E_RPCD_DIAG_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(3600)
}

/// Per-RPC deadline (default 20s).
pub fn rpc_deadline() -> Duration {
    std::env::var("B10E_RPCD_RPC_DEADLINE_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(20))
}

/// Shutdown drain timeout.
pub fn drain_timeout() -> Duration {
    std::env::var("B10E_RPCD_DRAIN_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(25))
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
