// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC protocol for the appliance's local daemons.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. The
//! same framing carries three conversations: the config daemon
//! request/response (plus watch streams), the broker subscription stream,
//! and fire-and-forget state reports to the master control program.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod broker;
mod cfg;
mod frame;
mod mcp;

pub use broker::{BrokerEnvelope, SubRequest};
pub use cfg::{CfgRequest, CfgResponse, WatchKind};
pub use frame::{decode, encode, read_message, write_message, ProtocolError};
pub use mcp::McpRequest;
