// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Conversions between chrono wall-clock time and protobuf timestamps.

use chrono::{DateTime, TimeZone, Utc};
use prost_types::Timestamp;

pub fn to_proto(ts: DateTime<Utc>) -> Timestamp {
    Timestamp { seconds: ts.timestamp(), nanos: ts.timestamp_subsec_nanos() as i32 }
}

pub fn from_proto(ts: &Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.try_into().ok()?).single()
}

#[cfg(test)]
#[path = "ptime_tests.rs"]
mod tests;
