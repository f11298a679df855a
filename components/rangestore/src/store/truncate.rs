// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Raft log truncation, in its two regimes.
//!
//! Strongly coupled truncation happens inside the application batch: the
//! truncated state and the log deletion commit atomically with the command.
//! Loosely coupled truncation only enqueues the intent; the background
//! truncator later advances the log under its own mutex. The regimes may
//! diverge across replicas in *when* they truncate without affecting the
//! state machine, because the raft log is not part of it.

use std::collections::HashMap;

use parking_lot::Mutex;
use slog_global::{debug, info};
use storage_engine::{StorageBatch, StorageEngine};

use crate::store::state::{
    load_truncated_state, write_truncated_state, RangeId, TruncatedState,
};
use crate::store::store::Store;
use crate::Result;

/// Applies a truncation into the batch: writes the truncated state and
/// deletes the log entries below the new first index. Returns false if the
/// replica's log already starts past the truncation point, in which case
/// nothing is staged and the caller must discard the in-memory update too.
pub(crate) fn handle_truncated_state_pre_apply<B: StorageBatch>(
    wb: &mut B,
    range_id: RangeId,
    prev: &TruncatedState,
    next: &TruncatedState,
) -> Result<bool> {
    if next.index <= prev.index {
        return Ok(false);
    }
    write_truncated_state(wb, range_id, next)?;
    wb.delete_range(
        &keys::raft_log_key(range_id, 0),
        &keys::raft_log_key(range_id, next.index + 1),
    )?;
    Ok(true)
}

/// A truncation deferred by a command applying under the loosely coupled
/// regime.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingTruncation {
    pub state: TruncatedState,
    /// First log index the proposer expected this replica to have. A
    /// mismatch means the log size bookkeeping guided by the proposer is off.
    pub expected_first_index: u64,
    pub log_delta: i64,
}

/// Background raft log truncator. Accumulates deferred truncations and
/// applies them outside the application loop, under its own mutex.
pub struct RaftLogTruncator<E: StorageEngine> {
    engine: E,
    pending: Mutex<HashMap<RangeId, PendingTruncation>>,
}

impl<E: StorageEngine> RaftLogTruncator<E> {
    pub(crate) fn new(engine: E) -> RaftLogTruncator<E> {
        RaftLogTruncator {
            engine,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_pending_truncation(&self, range_id: RangeId, truncation: PendingTruncation) {
        debug!(
            "queueing pending raft log truncation";
            "range_id" => range_id,
            "index" => truncation.state.index,
        );
        let mut pending = self.pending.lock();
        pending
            .entry(range_id)
            .and_modify(|existing| {
                // Merge consecutive truncations, keeping the furthest point
                // and accumulating the size deltas.
                if truncation.state.index > existing.state.index {
                    existing.state = truncation.state.clone();
                    existing.expected_first_index = truncation.expected_first_index;
                }
                existing.log_delta += truncation.log_delta;
            })
            .or_insert(truncation);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Applies every queued truncation to the engine and publishes the new
    /// truncated states to the replicas.
    pub fn durably_truncate(&self, store: &Store<E>) -> Result<()> {
        let drained: Vec<(RangeId, PendingTruncation)> =
            self.pending.lock().drain().collect();
        for (range_id, truncation) in drained {
            let replica = match store.get_replica(range_id) {
                Ok(replica) => replica,
                // The replica went away with its data; nothing to truncate.
                Err(_) => continue,
            };

            let current = load_truncated_state(&self.engine, range_id)?.unwrap_or_default();
            let mut wb = self.engine.write_batch();
            if !handle_truncated_state_pre_apply(
                &mut wb,
                range_id,
                &current,
                &truncation.state,
            )? {
                continue;
            }
            wb.commit(false)?;

            let mut mu = replica.mu.lock();
            mu.state.truncated_state = truncation.state.clone();
            mu.raft_log_size = (mu.raft_log_size + truncation.log_delta).max(0);
            if truncation.expected_first_index != current.index + 1 {
                mu.raft_log_size_trusted = false;
            }
            info!(
                "raft log truncated";
                "range_id" => range_id,
                "index" => truncation.state.index,
                "log_size" => mu.raft_log_size,
            );
        }
        Ok(())
    }
}
