// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud gRPC surface for the appliance liaison.
//!
//! The protobuf source of truth is `proto/cloud_rpc.proto`; the Rust in
//! `src/gen/` is committed tonic-build output so the workspace builds
//! without protoc. Regenerate after editing the proto.

#[allow(clippy::derive_partial_eq_without_eq)]
#[path = "gen/cloud_rpc.rs"]
pub mod cloud_rpc;

/// Fully-qualified type URL for an event payload message, as placed in
/// `PutEventRequest.payload.type_url`.
pub fn type_url(message_name: &str) -> String {
    format!("type.googleapis.com/cloud_rpc.{message_name}")
}
