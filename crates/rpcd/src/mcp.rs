// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reporting daemon state to the master control program.
//!
//! The mcp owns the daemon's process lifecycle; all we ever tell it is
//! our state. The socket may legitimately be absent (developer machines),
//! so failures are logged and swallowed.

use ap_core::SupervisorState;
use ap_wire::{encode, write_message, McpRequest};
use std::path::PathBuf;
use tokio::net::UnixStream;
use tracing::warn;

const DAEMON_NAME: &str = "rpcd";

#[derive(Clone)]
pub struct McpClient {
    socket_path: PathBuf,
}

impl McpClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Report our state. Best effort: never fails the caller.
    pub async fn set_state(&self, state: SupervisorState) {
        let req =
            McpRequest::SetState { daemon: DAEMON_NAME.to_string(), state: state.to_string() };
        if let Err(e) = self.send(&req).await {
            warn!(state = %state, error = %e, "failed to report state to mcp");
        }
    }

    async fn send(&self, req: &McpRequest) -> Result<(), ap_wire::ProtocolError> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let payload = encode(req)?;
        write_message(&mut stream, &payload).await
    }
}
