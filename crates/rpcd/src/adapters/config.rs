// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config-daemon client over the local Unix socket.
//!
//! Request/response ops open a fresh connection per call; watches hold a
//! dedicated connection each and dispatch notifications to the registered
//! callback. Callbacks only enqueue — the dispatch task never blocks on
//! subsystem locks.

use ap_core::config::{CfgError, CfgOp, ConfigHandle, PropNode, WatchCallback};
use ap_wire::{decode, encode, read_message, write_message, CfgRequest, CfgResponse, WatchKind};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, warn};

const OP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct UnixConfigHandle {
    socket_path: PathBuf,
}

impl UnixConfigHandle {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Probe the daemon; used at startup where a missing config daemon is
    /// fatal.
    pub async fn ping(&self) -> Result<(), CfgError> {
        match self.roundtrip(&CfgRequest::Ping).await? {
            CfgResponse::Ok { .. } => Ok(()),
            other => Err(to_cfg_error(other)),
        }
    }

    async fn roundtrip(&self, req: &CfgRequest) -> Result<CfgResponse, CfgError> {
        tokio::time::timeout(OP_TIMEOUT, self.roundtrip_inner(req))
            .await
            .map_err(|_| CfgError::Timeout)?
    }

    async fn roundtrip_inner(&self, req: &CfgRequest) -> Result<CfgResponse, CfgError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| CfgError::Comm(e.to_string()))?;
        let payload = encode(req).map_err(|e| CfgError::Comm(e.to_string()))?;
        write_message(&mut stream, &payload).await.map_err(|e| CfgError::Comm(e.to_string()))?;
        let raw = read_message(&mut stream).await.map_err(|e| CfgError::Comm(e.to_string()))?;
        decode(&raw).map_err(|e| CfgError::Comm(e.to_string()))
    }

    async fn watch(&self, kind: WatchKind, pattern: &str, cb: WatchCallback) -> Result<(), CfgError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| CfgError::Comm(e.to_string()))?;
        let req = CfgRequest::Watch { kind, pattern: pattern.to_string() };
        let payload = encode(&req).map_err(|e| CfgError::Comm(e.to_string()))?;
        write_message(&mut stream, &payload).await.map_err(|e| CfgError::Comm(e.to_string()))?;

        let pattern = pattern.to_string();
        tokio::spawn(async move {
            loop {
                let raw = match read_message(&mut stream).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(pattern = %pattern, error = %e, "config watch stream closed");
                        return;
                    }
                };
                let resp: CfgResponse = match decode(&raw) {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(pattern = %pattern, error = %e, "undecodable watch notification");
                        continue;
                    }
                };
                match resp {
                    CfgResponse::Change { prop, value, .. } => cb(&prop, value.as_deref()),
                    CfgResponse::Deleted { prop } | CfgResponse::Expired { prop } => cb(&prop, None),
                    other => debug!(pattern = %pattern, ?other, "ignoring non-notification frame"),
                }
            }
        });
        Ok(())
    }
}

fn to_cfg_error(resp: CfgResponse) -> CfgError {
    resp.as_cfg_error().unwrap_or_else(|| CfgError::Comm("unexpected response".to_string()))
}

#[async_trait]
impl ConfigHandle for UnixConfigHandle {
    async fn get_prop(&self, path: &str) -> Result<String, CfgError> {
        match self.roundtrip(&CfgRequest::Get { path: path.to_string() }).await? {
            CfgResponse::Ok { value: Some(value) } => Ok(value),
            CfgResponse::Ok { value: None } => Err(CfgError::NoProp),
            other => Err(to_cfg_error(other)),
        }
    }

    async fn get_props(&self, path: &str) -> Result<PropNode, CfgError> {
        match self.roundtrip(&CfgRequest::GetTree { path: path.to_string() }).await? {
            CfgResponse::Tree { node } => Ok(node),
            other => Err(to_cfg_error(other)),
        }
    }

    async fn execute(&self, ops: &[CfgOp]) -> Result<String, CfgError> {
        match self.roundtrip(&CfgRequest::Execute { ops: ops.to_vec() }).await? {
            CfgResponse::Ok { value } => Ok(value.unwrap_or_default()),
            other => Err(to_cfg_error(other)),
        }
    }

    async fn delete_prop(&self, path: &str) -> Result<(), CfgError> {
        match self.roundtrip(&CfgRequest::Delete { path: path.to_string() }).await? {
            CfgResponse::Ok { .. } => Ok(()),
            other => Err(to_cfg_error(other)),
        }
    }

    async fn replace(&self, tree_json: &str) -> Result<(), CfgError> {
        match self.roundtrip(&CfgRequest::Replace { tree: tree_json.to_string() }).await? {
            CfgResponse::Ok { .. } => Ok(()),
            other => Err(to_cfg_error(other)),
        }
    }

    async fn handle_change(&self, pattern: &str, cb: WatchCallback) -> Result<(), CfgError> {
        self.watch(WatchKind::Change, pattern, cb).await
    }

    async fn handle_delete(&self, pattern: &str, cb: WatchCallback) -> Result<(), CfgError> {
        self.watch(WatchKind::Delete, pattern, cb).await
    }

    async fn handle_expire(&self, pattern: &str, cb: WatchCallback) -> Result<(), CfgError> {
        self.watch(WatchKind::Expire, pattern, cb).await
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
