// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config-tree operations, events, and the handle contract.
//!
//! The configuration tree itself lives in a separate daemon; this module
//! defines the operations the liaison submits to it, the change events it
//! receives back, and the completion records it reports to the cloud.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Operation kind within a config command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CfgOpKind {
    Get,
    Set,
    Create,
    Delete,
    /// Local-only guard: fails the batch with [`CfgError::NotEqual`] when
    /// the property's current value differs from `value`.
    TestEq,
}

crate::simple_display! {
    CfgOpKind {
        Get => "get",
        Set => "set",
        Create => "create",
        Delete => "delete",
        TestEq => "test_eq",
    }
}

/// A single typed operation against a property path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgOp {
    pub op: CfgOpKind,
    pub prop: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl CfgOp {
    pub fn get(prop: impl Into<String>) -> Self {
        Self { op: CfgOpKind::Get, prop: prop.into(), value: None, expires: None }
    }

    pub fn set(prop: impl Into<String>, value: impl Into<String>) -> Self {
        Self { op: CfgOpKind::Set, prop: prop.into(), value: Some(value.into()), expires: None }
    }

    pub fn create(prop: impl Into<String>, value: impl Into<String>) -> Self {
        Self { op: CfgOpKind::Create, prop: prop.into(), value: Some(value.into()), expires: None }
    }

    pub fn delete(prop: impl Into<String>) -> Self {
        Self { op: CfgOpKind::Delete, prop: prop.into(), value: None, expires: None }
    }

    /// Guard op: the batch fails with `NotEqual` unless `prop` currently
    /// holds `value` (empty `value` asserts the property is absent).
    pub fn test_eq(prop: impl Into<String>, value: impl Into<String>) -> Self {
        Self { op: CfgOpKind::TestEq, prop: prop.into(), value: Some(value.into()), expires: None }
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// True for the bare full-tree refresh (`GET @/`).
    pub fn is_tree_refresh(&self) -> bool {
        self.op == CfgOpKind::Get && self.prop == "@/"
    }
}

/// A cloud-issued batch of operations with its monotonic command ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgCmd {
    pub cmd_id: i64,
    pub ops: Vec<CfgOp>,
}

impl CfgCmd {
    /// True if the command is exactly one full-tree refresh.
    pub fn is_refresh(&self) -> bool {
        self.ops.len() == 1 && self.ops[0].is_tree_refresh()
    }
}

/// Kind of a config update event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Update,
    Delete,
}

/// A local tree mutation, forwarded to the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgUpdate {
    pub kind: UpdateKind,
    pub prop: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Root hash of the tree after this mutation.
    pub hash: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

/// Completion status reported for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Ok,
    Failed,
    Queued,
    InProgress,
}

/// The reply for a single command, sent back to the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgCompletion {
    pub cmd_id: i64,
    pub status: CompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl CfgCompletion {
    pub fn ok(cmd_id: i64, value: Option<String>) -> Self {
        Self { cmd_id, status: CompletionStatus::Ok, value, errmsg: None }
    }

    pub fn failed(cmd_id: i64, errmsg: impl Into<String>) -> Self {
        Self { cmd_id, status: CompletionStatus::Failed, value: None, errmsg: Some(errmsg.into()) }
    }
}

/// Sentinel errors surfaced by the config daemon.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CfgError {
    #[error("no such property")]
    NoProp,

    #[error("operation not supported")]
    NotSupp,

    #[error("config operation timed out")]
    Timeout,

    /// Optimistic-concurrency check failed (`TestEq` mismatch).
    #[error("property value changed")]
    NotEqual,

    #[error("malformed property: {0}")]
    BadProp(String),

    #[error("config daemon unreachable: {0}")]
    Comm(String),
}

/// A subtree of the property tree, as returned by `get_props`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub children: HashMap<String, PropNode>,
}

impl PropNode {
    /// Descend to a child subtree by relative path segments.
    pub fn child(&self, path: &str) -> Option<&PropNode> {
        let mut node = self;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            node = node.children.get(seg)?;
        }
        Some(node)
    }

    /// Value of a child leaf, if present.
    pub fn child_value(&self, path: &str) -> Option<&str> {
        self.child(path).and_then(|n| n.value.as_deref())
    }
}

/// Callback invoked for a watched property change.
///
/// Arguments are `(property, value)`; deletions and expirations pass the
/// property only. Callbacks run on the watch dispatch task and must not
/// block or perform I/O — enqueue and return.
pub type WatchCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// Handle to the local configuration daemon.
///
/// The tree is owned by a separate process; this is the full surface the
/// liaison needs from it.
#[async_trait]
pub trait ConfigHandle: Send + Sync {
    /// Fetch a single property value.
    async fn get_prop(&self, path: &str) -> Result<String, CfgError>;

    /// Fetch a subtree rooted at `path`.
    async fn get_props(&self, path: &str) -> Result<PropNode, CfgError>;

    /// Submit a batch of operations and await the result value.
    async fn execute(&self, ops: &[CfgOp]) -> Result<String, CfgError>;

    /// Delete a property (and its subtree).
    async fn delete_prop(&self, path: &str) -> Result<(), CfgError>;

    /// Replace the entire tree with a serialized export.
    async fn replace(&self, tree_json: &str) -> Result<(), CfgError>;

    /// Register a callback for changes to properties matching `pattern`.
    async fn handle_change(&self, pattern: &str, cb: WatchCallback) -> Result<(), CfgError>;

    /// Register a callback for deletions of properties matching `pattern`.
    async fn handle_delete(&self, pattern: &str, cb: WatchCallback) -> Result<(), CfgError>;

    /// Register a callback for expirations of properties matching `pattern`.
    async fn handle_expire(&self, pattern: &str, cb: WatchCallback) -> Result<(), CfgError>;
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
