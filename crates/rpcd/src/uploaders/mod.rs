// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Report upload pipelines: heartbeat, device inventory, fault reports.
//!
//! All three share the publish path in [`publish`]: each event is wrapped
//! in a `PutEventRequest` and a `BAD_ENDPOINT` reply re-points the
//! endpoint property and restarts the daemon.

pub mod faults;
pub mod heartbeat;
pub mod inventory;
pub mod publish;

pub use faults::FaultUploader;
pub use inventory::InventoryUploader;
pub use publish::{EventSender, PublishError};
