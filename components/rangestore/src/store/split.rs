// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use slog_global::info;
use storage_engine::{StorageBatch, StorageEngine};

use crate::store::command::SplitTrigger;
use crate::store::hlc::Timestamp;
use crate::store::state::{
    load_applied_state, load_hard_state, load_tombstone, write_applied_state, write_hard_state,
    write_tombstone, HardState,
};
use crate::store::store::Store;
use crate::Result;

/// Log position at which a freshly split right-hand side starts.
pub const RAFT_INITIAL_LOG_INDEX: u64 = 10;
pub const RAFT_INITIAL_LOG_TERM: u64 = 5;

/// Prepares the right-hand side of a split inside the application batch.
///
/// The RHS hard state cannot be produced at evaluation time because vote
/// state is replica-local: an uninitialized RHS replica may already have cast
/// votes. The vote is preserved and the rest of the hard state is positioned
/// at the initial log index, atomically with the split batch.
///
/// If the RHS replica was already removed from this store (there is a
/// tombstone past the RHS replica ID from the descriptor), the split must not
/// resurrect it: the RHS state written by the split's write batch is cleared
/// instead.
pub(crate) fn split_pre_apply<E: StorageEngine, B: StorageBatch>(
    store: &Store<E>,
    wb: &mut B,
    split: &SplitTrigger,
    closed_timestamp: Option<Timestamp>,
) -> Result<()> {
    let rhs_desc = &split.right_desc;
    let rhs_range_id = rhs_desc.range_id;
    let rhs_replica = rhs_desc.replica_on(store.store_id()).ok_or_else(|| {
        crate::Error::AssertionFailed(format!(
            "store {} not in right-hand descriptor of split: {:?}",
            store.store_id(),
            rhs_desc
        ))
    })?;

    if let Some(next_replica_id) = load_tombstone(wb, rhs_range_id)? {
        if next_replica_id > rhs_replica.replica_id {
            info!(
                "right-hand side of split was already removed, clearing its state";
                "range_id" => rhs_range_id,
                "replica_id" => rhs_replica.replica_id,
                "tombstone_next_replica_id" => next_replica_id,
            );
            let (start, end) = keys::range_id_local_span(rhs_range_id);
            wb.delete_range(&start, &end)?;
            let (start, end) = keys::range_local_span(&rhs_desc.start_key, &rhs_desc.end_key);
            wb.delete_range(&start, &end)?;
            let (start, end) = keys::data_span(&rhs_desc.start_key, &rhs_desc.end_key);
            wb.delete_range(&start, &end)?;
            write_tombstone(wb, rhs_range_id, next_replica_id)?;
            return Ok(());
        }
    }

    let vote = load_hard_state(wb, rhs_range_id)?.map_or(0, |hs| hs.vote);
    write_hard_state(
        wb,
        rhs_range_id,
        &HardState {
            term: RAFT_INITIAL_LOG_TERM,
            vote,
            commit: RAFT_INITIAL_LOG_INDEX,
        },
    )?;

    // The split's write batch initialized the RHS applied state at evaluation
    // time; carry the command's closed timestamp into it so the RHS starts
    // with the promise the LHS already made.
    if let Some(cts) = closed_timestamp {
        if let Some(mut applied) = load_applied_state(wb, rhs_range_id)? {
            if applied.raft_closed_timestamp.forward(cts) {
                write_applied_state(wb, rhs_range_id, &applied)?;
            }
        }
    }
    Ok(())
}
