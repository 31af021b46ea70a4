// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config-daemon request/response envelopes.
//!
//! A connection normally alternates request/response. Sending `Watch`
//! turns it into a one-way stream of `Change`/`Deleted`/`Expired`
//! notifications for properties matching the pattern.

use ap_core::config::{CfgOp, PropNode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which tree transition a watch subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Change,
    Delete,
    Expire,
}

/// Requests accepted by the config daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CfgRequest {
    Ping,
    Get { path: String },
    GetTree { path: String },
    Execute { ops: Vec<CfgOp> },
    Delete { path: String },
    Replace { tree: String },
    Watch { kind: WatchKind, pattern: String },
}

/// Responses and watch notifications from the config daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CfgResponse {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    Tree {
        node: PropNode,
    },
    Err {
        kind: String,
        msg: String,
    },
    Change {
        prop: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires: Option<DateTime<Utc>>,
    },
    Deleted {
        prop: String,
    },
    Expired {
        prop: String,
    },
}

impl CfgResponse {
    /// Map a sentinel-error response back to the typed error.
    pub fn as_cfg_error(&self) -> Option<ap_core::CfgError> {
        let CfgResponse::Err { kind, msg } = self else { return None };
        Some(match kind.as_str() {
            "no_prop" => ap_core::CfgError::NoProp,
            "not_supp" => ap_core::CfgError::NotSupp,
            "timeout" => ap_core::CfgError::Timeout,
            "not_equal" => ap_core::CfgError::NotEqual,
            "bad_prop" => ap_core::CfgError::BadProp(msg.clone()),
            _ => ap_core::CfgError::Comm(msg.clone()),
        })
    }
}

#[cfg(test)]
#[path = "cfg_tests.rs"]
mod tests;
