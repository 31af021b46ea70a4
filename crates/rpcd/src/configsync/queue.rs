// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared queue record for the config-sync loops.
//!
//! One mutex guards updates, completions, and the command high-water
//! mark. Appends and drains hold the lock briefly; no I/O ever happens
//! under it. A capacity-1 channel wakes the push loop; senders use
//! `try_send` and never block.

use ap_cloud::cloud_rpc::{CfgCompletion, CfgUpdate};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Max records drained into a single RPC.
pub const MAX_UPDATES: usize = 64;
pub const MAX_COMPLETIONS: usize = 64;

#[derive(Default)]
struct QueueState {
    updates: VecDeque<CfgUpdate>,
    completions: VecDeque<CfgCompletion>,
    last_cmd_id: i64,
}

pub struct SyncQueues {
    state: Mutex<QueueState>,
    updated_tx: mpsc::Sender<()>,
}

impl SyncQueues {
    /// Returns the queue record and the receiver the push loop waits on.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (updated_tx, updated_rx) = mpsc::channel(1);
        (Self { state: Mutex::new(QueueState::default()), updated_tx }, updated_rx)
    }

    /// Wake the push loop. Lossy by design: one pending wake is enough.
    pub fn poke(&self) {
        let _ = self.updated_tx.try_send(());
    }

    pub fn append_update(&self, update: CfgUpdate) {
        let was_empty = {
            let mut state = self.state.lock();
            let was_empty = state.updates.is_empty();
            state.updates.push_back(update);
            was_empty
        };
        if was_empty {
            self.poke();
        }
    }

    pub fn append_completion(&self, completion: CfgCompletion) {
        let was_empty = {
            let mut state = self.state.lock();
            let was_empty = state.completions.is_empty();
            state.completions.push_back(completion);
            was_empty
        };
        if was_empty {
            self.poke();
        }
    }

    /// Drop all queued updates (a full-tree refresh subsumes them).
    pub fn drop_updates(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.updates.len();
        state.updates.clear();
        dropped
    }

    pub fn drain_updates(&self, max: usize) -> Vec<CfgUpdate> {
        let mut state = self.state.lock();
        let n = state.updates.len().min(max);
        state.updates.drain(..n).collect()
    }

    pub fn drain_completions(&self, max: usize) -> Vec<CfgCompletion> {
        let mut state = self.state.lock();
        let n = state.completions.len().min(max);
        state.completions.drain(..n).collect()
    }

    /// Put a failed send back at the head, preserving order.
    pub fn requeue_updates(&self, batch: Vec<CfgUpdate>) {
        let mut state = self.state.lock();
        for update in batch.into_iter().rev() {
            state.updates.push_front(update);
        }
    }

    pub fn requeue_completions(&self, batch: Vec<CfgCompletion>) {
        let mut state = self.state.lock();
        for completion in batch.into_iter().rev() {
            state.completions.push_front(completion);
        }
    }

    pub fn updates_len(&self) -> usize {
        self.state.lock().updates.len()
    }

    pub fn completions_len(&self) -> usize {
        self.state.lock().completions.len()
    }

    pub fn last_cmd_id(&self) -> i64 {
        self.state.lock().last_cmd_id
    }

    /// Raise the high-water mark; never lowers it.
    pub fn observe_cmd_id(&self, cmd_id: i64) {
        let mut state = self.state.lock();
        state.last_cmd_id = state.last_cmd_id.max(cmd_id);
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
