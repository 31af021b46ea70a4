// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local event-broker surface.
//!
//! The broker is a separate pub/sub daemon; subscribers receive serialized
//! event payloads by topic name.

use async_trait::async_trait;
use std::sync::Arc;

/// Config-tree change notifications.
pub const TOPIC_CONFIG: &str = "config";
/// Appliance-local fault/exception records.
pub const TOPIC_EXCEPTION: &str = "exception";
/// Device-inventory spool refresh notifications.
pub const TOPIC_DEVICE_INVENTORY: &str = "device_inventory";

/// Callback receiving a serialized event payload.
///
/// Runs on the broker dispatch task; must not block.
pub type TopicCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Handle to the local event broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe `cb` to all events published on `topic`.
    async fn handle(&self, topic: &str, cb: TopicCallback) -> std::io::Result<()>;
}
