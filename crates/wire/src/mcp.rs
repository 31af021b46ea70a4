// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Master-control-program envelopes. Fire-and-forget: no response frame.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpRequest {
    /// Report a daemon's state (`OK`, `BROKEN`).
    SetState { daemon: String, state: String },
}
