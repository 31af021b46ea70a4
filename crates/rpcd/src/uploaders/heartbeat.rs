// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic heartbeat: boot time plus a fresh record time.

use super::publish::EventSender;
use crate::ptime;
use ap_cloud::cloud_rpc;
use ap_core::Clock;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(7 * 60);

pub fn build<C: Clock>(boot_time: DateTime<Utc>, clock: &C) -> cloud_rpc::Heartbeat {
    cloud_rpc::Heartbeat {
        boot_time: Some(ptime::to_proto(boot_time)),
        record_time: Some(ptime::to_proto(clock.wall())),
    }
}

/// Publish one heartbeat.
pub async fn send_one<C: Clock>(
    sender: &EventSender,
    boot_time: DateTime<Utc>,
    clock: &C,
) -> Result<(), super::publish::PublishError> {
    sender.put("heartbeat", "Heartbeat", &build(boot_time, clock)).await
}

/// Heartbeat every seven minutes until told to stop.
pub async fn run<C: Clock>(
    sender: EventSender,
    boot_time: DateTime<Utc>,
    clock: C,
    mut done: mpsc::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = done.recv() => return,
            _ = tick.tick() => {}
        }
        match send_one(&sender, boot_time, &clock).await {
            Ok(()) => debug!("heartbeat published"),
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }
}

#[cfg(test)]
#[path = "heartbeat_tests.rs"]
mod tests;
