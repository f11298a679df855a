// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The replica application batch.
//!
//! Committed raft commands are applied to the state machine in a multi-stage
//! process: each command is checked against the batch's view of the replica
//! state, staged into the storage engine batch together with its side
//! effects, and reflected into the view so the next command is checked
//! against accurate state. The storage batch then commits atomically and the
//! new state is published to the replica under its inner lock.
//!
//! The caller drives a batch through `stage` once per command, then
//! `apply_to_state_machine`, then `close`, all while holding the replica's
//! raft mutex.

use std::sync::Arc;
use std::time::Instant;

use fail::fail_point;
use lazy_static::lazy_static;
use slog_global::{debug, error};
use storage_engine::{raw, StorageBatch, StorageEngine};

use crate::store::command::{ForcedError, Proposal, ReplicatedCommand};
use crate::store::metrics::*;
use crate::store::replica::{
    maybe_acquire_split_merge_lock, RaftLocked, Replica, SplitMergeLock,
};
use crate::store::sideload::add_sstable_pre_apply;
use crate::store::split::split_pre_apply;
use crate::store::state::{
    write_applied_state, AppliedState, ClosedTimestampSetterInfo, ReplicaId, ReplicaState,
};
use crate::store::store::Store;
use crate::store::truncate::{handle_truncated_state_pre_apply, PendingTruncation};
use crate::store::util::env_bool;
use crate::{Error, Result};

/// Tombstone replica ID left on the right-hand side of a merge. The merge
/// protocol guarantees no replica of the subsumed range can be created again;
/// the maximum ID makes that structural.
pub const MERGED_TOMBSTONE_REPLICA_ID: ReplicaId = i32::MAX as ReplicaId;

/// Environment toggle for the closed timestamp assertions, for emergency
/// operation only. Read once at startup.
pub const RAFT_CLOSEDTS_ASSERTIONS_VAR: &str = "RANGESTORE_RAFT_CLOSEDTS_ASSERTIONS_ENABLED";

const ASSERT_LOG_TAIL_MAX_ENTRIES: usize = 100;
const ASSERT_LOG_TAIL_MAX_CHARS_PER_ENTRY: usize = 2000;

lazy_static! {
    static ref RAFT_CLOSEDTS_ASSERTIONS_ENABLED: bool =
        env_bool(RAFT_CLOSEDTS_ASSERTIONS_VAR, true);
}

/// Decides whether a command should apply against the given view of the
/// replica state, and the lease applied index the view advances to.
///
/// This is a pure function of `(state, cmd)` and must stay that way: every
/// replica runs it against the identical view after the identical prefix of
/// commands, so every replica accepts and rejects the same commands.
///
/// Returns `(lease_index, forced_err)`: the command's ceiling when it
/// applies, the unchanged view value plus the rejection when it does not.
pub fn check_forced_err(
    state: &ReplicaState,
    cmd: &ReplicatedCommand,
) -> (u64, Option<ForcedError>) {
    if cmd.max_lease_index <= state.lease_applied_index {
        return (
            state.lease_applied_index,
            Some(ForcedError::LeaseIndexMismatch {
                max_lease_index: cmd.max_lease_index,
                applied: state.lease_applied_index,
            }),
        );
    }
    if cmd.proposer_lease_seq != state.lease.sequence {
        return (
            state.lease_applied_index,
            Some(ForcedError::NotLeaseholder {
                proposed: cmd.proposer_lease_seq,
                held: state.lease.sequence,
                leaseholder: state.lease.replica_id,
            }),
        );
    }
    let write_timestamp = cmd.result.write_timestamp;
    if !write_timestamp.is_empty() && write_timestamp <= state.gc_threshold {
        return (
            state.lease_applied_index,
            Some(ForcedError::BatchTimestampBelowGc {
                write_timestamp,
                threshold: state.gc_threshold,
            }),
        );
    }
    (cmd.max_lease_index, None)
}

/// Runs the rejection check and records its outcome on the command.
pub(crate) fn should_apply_command(state: &ReplicaState, cmd: &mut ReplicatedCommand) -> bool {
    let (lease_index, forced_err) = check_forced_err(state, cmd);
    cmd.lease_index = lease_index;
    cmd.forced_err = forced_err;
    cmd.forced_err.is_none()
}

/// Byte accounting for commands proposed elsewhere and applied here.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FollowerStoreWriteBytes {
    pub num_entries: u64,
    pub write_bytes: u64,
    pub ingested_bytes: u64,
}

impl FollowerStoreWriteBytes {
    pub fn merge(&mut self, other: FollowerStoreWriteBytes) {
        self.num_entries += other.num_entries;
        self.write_bytes += other.write_bytes;
        self.ingested_bytes += other.ingested_bytes;
    }
}

/// Running totals of entry application on one replica.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ApplyStats {
    pub entries_processed: u64,
    pub entries_processed_bytes: u64,
    pub num_empty_entries: u64,
    pub batches_processed: u64,
    pub follower_store_write_bytes: FollowerStoreWriteBytes,
}

/// The application batch for one replica.
///
/// Accumulates the effects of a run of committed commands into a storage
/// engine batch plus a private copy of the replica state, then commits both
/// atomically.
pub struct ReplicaAppBatch<'a, E: StorageEngine> {
    store: &'a Store<E>,
    replica: &'a Arc<Replica>,
    raft: &'a mut RaftLocked,

    batch: Option<E::Batch>,
    /// This batch's view of the replica state, copied from under the replica
    /// lock at construction and advanced as commands are staged.
    state: ReplicaState,
    closed_timestamp_setter: ClosedTimestampSetterInfo,
    /// Whether the command in the batch (there can be only one such command)
    /// removes this replica from the range.
    change_removes_replica: bool,
    split_merge_lock: Option<SplitMergeLock>,
    /// Local proposers to notify once the batch has committed.
    notifications: Vec<(Option<ForcedError>, Proposal)>,
    raft_log_delta: i64,
    staged_non_trivial: bool,

    // Statistics.
    entries: u64,
    entry_bytes: u64,
    empty_entries: u64,
    mutations: u64,
    follower_store_write_bytes: FollowerStoreWriteBytes,
    start: Instant,
}

impl<'a, E: StorageEngine> ReplicaAppBatch<'a, E> {
    /// Binds a new application batch to `replica` and a fresh storage engine
    /// batch. The caller must hold the replica's raft mutex, witnessed by
    /// `raft`, for the lifetime of the batch.
    pub fn new(
        store: &'a Store<E>,
        replica: &'a Arc<Replica>,
        raft: &'a mut RaftLocked,
    ) -> ReplicaAppBatch<'a, E> {
        ReplicaAppBatch {
            store,
            replica,
            raft,
            batch: Some(store.engine().write_batch()),
            state: replica.state_view(),
            closed_timestamp_setter: replica.mu.lock().closed_timestamp_setter.clone(),
            change_removes_replica: false,
            split_merge_lock: None,
            notifications: vec![],
            raft_log_delta: 0,
            staged_non_trivial: false,
            entries: 0,
            entry_bytes: 0,
            empty_entries: 0,
            mutations: 0,
            follower_store_write_bytes: FollowerStoreWriteBytes::default(),
            start: Instant::now(),
        }
    }

    /// The batch's current view of the replica state.
    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    /// Handles the first phase of applying a command.
    ///
    /// The command is first checked against the batch's state view; a failed
    /// check wipes its payload and records a forced error, turning it into an
    /// empty entry whose error reaches the waiting proposer after commit.
    /// Accepted commands have their write batch and side-effect triggers
    /// staged, then their trivial state updates folded into the view so the
    /// next command is checked against accurate state.
    ///
    /// An error return means the replica can no longer be allowed to make
    /// progress: it is either corrupted or would diverge from its peers.
    pub fn stage(&mut self, cmd: &mut ReplicatedCommand) -> Result<()> {
        if cmd.index == 0 {
            return Err(Error::AssertionFailed(format!(
                "{} processing a raft command needs a nonzero index",
                self.replica.tag()
            )));
        }
        let applied = self.state.raft_applied_index;
        if cmd.index != applied + 1 {
            // An out-of-order index means corruption. There is no sense in
            // running the command.
            return Err(Error::AssertionFailed(format!(
                "{} applied index jumped from {} to {}",
                self.replica.tag(),
                applied,
                cmd.index
            )));
        }
        // Non-trivial commands apply in batches of their own, in either
        // direction: nothing may be staged after one, and one may not join a
        // batch that already holds entries. This is what lets a later command
        // never shadow an earlier ingestion's writes.
        if self.staged_non_trivial || (!cmd.result.is_trivial() && self.entries > 0) {
            return Err(Error::AssertionFailed(format!(
                "{} command at index {} staged into a shared batch with a non-trivial command",
                self.replica.tag(),
                cmd.index
            )));
        }

        if !should_apply_command(&self.state, cmd) {
            let forced_err = cmd.forced_err.as_ref().unwrap();
            debug!(
                "applying command with forced error";
                "range_id" => self.replica.range_id(),
                "replica_id" => self.replica.replica_id(),
                "index" => cmd.index,
                "err" => %forced_err,
            );
            APPLY_FORCED_ERROR_COUNTER
                .with_label_values(&[forced_err.label()])
                .inc();
            // Apply an empty command instead.
            cmd.result = Default::default();
            cmd.write_batch = None;
            cmd.logical_ops = None;
            cmd.closed_timestamp = None;
        } else {
            self.assert_no_cmd_closed_timestamp_regression(cmd)?;
            self.assert_no_write_below_closed_timestamp(cmd)?;
            debug!(
                "applying command";
                "range_id" => self.replica.range_id(),
                "replica_id" => self.replica.replica_id(),
                "index" => cmd.index,
            );
        }

        // Acquire the split or merge lock, if necessary. If the command was
        // just rejected its result was cleared and this is a no-op.
        if let Some(lock) = maybe_acquire_split_merge_lock(self.store, &cmd.result)? {
            // Released by `apply_to_state_machine` after the commit.
            self.split_merge_lock = Some(lock);
        }

        migrate_replicated_result(self.replica.tag(), cmd);

        // Triggers that must see the batch before the command's own writes
        // are staged: previous values for the logical op log come from the
        // state the command found, which already reflects earlier commands in
        // this batch.
        if let Some(ops) = cmd.logical_ops.as_mut() {
            let wb = self.batch.as_ref().expect("batch already committed");
            self.replica.populate_prev_values(ops, wb)?;
        }

        // Account store write sizes now; the triggers below clear the
        // ingestion from the result.
        if !cmd.is_local() {
            let (write_bytes, ingested_bytes) = cmd.store_write_byte_sizes();
            self.follower_store_write_bytes.num_entries += 1;
            self.follower_store_write_bytes.write_bytes += write_bytes;
            self.follower_store_write_bytes.ingested_bytes += ingested_bytes;
        }

        self.stage_write_batch(cmd)?;
        self.run_post_staging_triggers(cmd)?;
        self.stage_trivial_replicated_result(cmd);

        if !cmd.result.is_trivial() {
            self.staged_non_trivial = true;
        }
        self.entries += 1;
        self.entry_bytes += cmd.data_size;
        if cmd.data_size == 0 {
            self.empty_entries += 1;
        }
        if let Some(proposal) = cmd.proposal.take() {
            self.notifications.push((cmd.forced_err.clone(), proposal));
        }
        Ok(())
    }

    /// Applies the command's write batch to the storage engine batch. The
    /// mutation count decoded from the stream feeds load statistics only, so
    /// failing to decode it is logged and ignored.
    fn stage_write_batch(&mut self, cmd: &ReplicatedCommand) -> Result<()> {
        let data = match &cmd.write_batch {
            Some(data) => data,
            None => return Ok(()),
        };
        match raw::decode_count(data) {
            Ok(mutations) => self.mutations += mutations as u64,
            Err(e) => error!(
                "unable to read header of committed write batch";
                "range_id" => self.replica.range_id(),
                "index" => cmd.index,
                "err" => ?e,
            ),
        }
        let wb = self.batch.as_mut().expect("batch already committed");
        wb.apply_raw(data)?;
        Ok(())
    }

    /// Runs the triggers that fire after the command's write batch is staged
    /// but before the batch is applied, translating declarative side effects
    /// into storage batch edits and in-memory notifications. Visits the
    /// result's triggers in a fixed order; the order is load-bearing.
    fn run_post_staging_triggers(&mut self, cmd: &mut ReplicatedCommand) -> Result<()> {
        let Self {
            store,
            replica,
            raft,
            batch,
            state,
            split_merge_lock,
            change_removes_replica,
            raft_log_delta,
            ..
        } = self;
        let store = *store;
        let wb = batch.as_mut().expect("batch already committed");
        let res = &mut cmd.result;

        // MVCC history mutations invalidate what a rangefeed may already have
        // emitted for the span. The evaluator is expected to have kept
        // rangefeeds away from such spans; disconnect any that overlap with a
        // non-retriable error as a safeguard.
        if let Some(mutation) = &res.mvcc_history_mutation {
            for span in &mutation.spans {
                replica.disconnect_rangefeed_span(
                    span,
                    crate::store::rangefeed::RangefeedError::HistoryMutation(span.clone()),
                );
            }
        }

        // Ingestions go to the engine before the batch commits, so that when
        // the command is applied the ingestion has definitely succeeded.
        // Evaluation keeps the write batch free of mutations that would
        // shadow the file, and a command carrying an ingestion is non-trivial
        // and travels alone, so no other command in this batch can either.
        if let Some(sst) = res.add_sstable.take() {
            let copied =
                add_sstable_pre_apply(store.engine(), &raft.sideloaded, cmd.term, cmd.index, &sst)?;
            ADD_SSTABLE_APPLICATIONS.inc();
            if copied {
                ADD_SSTABLE_COPIES.inc();
            }
            if res.delta.key_count > 0 {
                replica.load_stats.record_write_keys(res.delta.key_count as u64);
            }
            if sst.at_write_timestamp {
                replica.handle_sst_ingest(sst.span.clone(), res.write_timestamp);
            }
        }

        if let Some(split) = &res.split {
            // The right-hand side needs a hard state written atomically with
            // this batch; see `split_pre_apply`.
            split_pre_apply(store, wb, split, cmd.closed_timestamp)?;

            // The rangefeed will no longer see logical ops for the whole
            // original span, so registrations have to retry.
            replica.disconnect_rangefeed(
                crate::store::rangefeed::RangefeedRetryReason::RangeSplit,
            );
        }

        if let Some(merge) = &res.merge {
            // The subsumed range is deleted atomically with the merge commit.
            let rhs = store.get_replica(merge.right_desc.range_id)?;
            // The split-merge lock acquired while staging already holds the
            // RHS raft mutex.
            let lock = split_merge_lock.as_ref().ok_or_else(|| {
                Error::AssertionFailed(format!(
                    "{} merge staged without the split-merge lock",
                    replica.tag()
                ))
            })?;
            lock.assert_held(&rhs);

            // Mark the RHS destroyed so it accepts no new commands; the
            // removal is finished after this batch commits.
            rhs.mark_destroyed(format!(
                "range {} merged into range {}",
                merge.right_desc.range_id,
                replica.range_id()
            ));

            // Only the RHS's range-ID-local state goes: its addressable data
            // now belongs to the merged range. The tombstone replica ID is
            // the sentinel maximum so the RHS can never be recreated.
            rhs.pre_destroy_raft_mu_locked(
                wb,
                MERGED_TOMBSTONE_REPLICA_ID,
                true,
                &merge.right_desc,
            )?;

            // Both sides may carry logical ops for keys the merge transaction
            // touched on the RHS; shut both feeds down.
            replica
                .disconnect_rangefeed(crate::store::rangefeed::RangefeedRetryReason::RangeMerged);
            rhs.disconnect_rangefeed(crate::store::rangefeed::RangefeedRetryReason::RangeMerged);
        }

        if let Some(res_state) = res.state.as_mut() {
            // The in-memory GC threshold is bumped before the batch commits.
            // Readers capture an engine snapshot and then validate it against
            // the in-memory threshold, so publishing first turns a racing
            // read into a clean failure instead of a stale result.
            if let Some(threshold) = res_state.gc_threshold.take() {
                replica.handle_gc_threshold(threshold);
            }
        }

        if res
            .state
            .as_ref()
            .map_or(false, |s| s.truncated_state.is_some())
        {
            // Raft log truncation is not part of the state machine, so
            // consulting a setting below raft is safe here; each replica only
            // has to truncate its own log correctly. Commands without an
            // expected first index fall back to the strongly coupled path.
            let loosely_coupled = store.cfg().loosely_coupled_raft_log_truncation
                && res.raft_expected_first_index > 0;
            let res_state = res.state.as_mut().unwrap();
            if !loosely_coupled {
                let next = res_state.truncated_state.as_ref().unwrap();
                let applied = handle_truncated_state_pre_apply(
                    wb,
                    replica.range_id(),
                    &state.truncated_state,
                    next,
                )?;
                if applied {
                    *raft_log_delta += res.raft_log_delta;
                } else {
                    // This replica's log already starts past the truncation
                    // point, so there is a leaseholder out there whose log
                    // deltas did not describe ours. Our log size bookkeeping
                    // can no longer be trusted.
                    res_state.truncated_state = None;
                    res.raft_log_delta = 0;
                    res.raft_expected_first_index = 0;
                    replica.mu.lock().raft_log_size_trusted = false;
                }
            } else {
                let next = res_state.truncated_state.take().unwrap();
                store.truncator().add_pending_truncation(
                    replica.range_id(),
                    PendingTruncation {
                        state: next,
                        expected_first_index: res.raft_expected_first_index,
                        log_delta: res.raft_log_delta,
                    },
                );
                res.raft_log_delta = 0;
                res.raft_expected_first_index = 0;
            }
        }

        // Detect whether this command removes us from the range. If so, all
        // of our local data is staged for deletion into this batch, hard
        // state included, so the removal lands in one durable commit. This is
        // the last trigger that writes to the batch.
        if let Some(change) = &res.change_replicas {
            if change.desc.replica_on(store.store_id()).is_none() {
                replica.mark_destroyed(format!(
                    "replica {} removed from range {}",
                    replica.replica_id(),
                    replica.range_id()
                ));
                *change_removes_replica = true;
                replica.pre_destroy_raft_mu_locked(
                    wb,
                    change.desc.next_replica_id,
                    false,
                    &state.desc,
                )?;
            }
        }

        // Hand the command's logical ops to the rangefeed. A write batch
        // without a logical op log is fine (no rangefeed may be running); the
        // reverse is a malformed command.
        if cmd.write_batch.is_some() {
            if let Some(ops) = &cmd.logical_ops {
                replica.handle_logical_ops(ops.clone());
            }
        } else if cmd.logical_ops.is_some() {
            panic!(
                "{} logical op log with no write batch: {:?}",
                replica.tag(),
                cmd
            );
        }

        Ok(())
    }

    /// Folds the command's trivial state updates into the batch's view. The
    /// replicated result itself is left intact apart from the documented
    /// clears, so post-apply inspection hooks see a faithful record.
    fn stage_trivial_replicated_result(&mut self, cmd: &mut ReplicatedCommand) {
        assert!(cmd.index > 0);
        self.state.raft_applied_index = cmd.index;
        self.state.raft_applied_index_term = cmd.term;
        if cmd.lease_index != 0 {
            self.state.lease_applied_index = cmd.lease_index;
        }
        if let Some(closed_ts) = cmd.closed_timestamp {
            if !closed_ts.is_empty() {
                self.state.raft_closed_timestamp = closed_ts;
                self.closed_timestamp_setter.record(cmd, &self.state.lease);
            }
        }
        // Stats deltas add commutatively, which the latch manager above
        // exploits: the stats key is not serialized between commands.
        self.state.stats.add(&cmd.result.delta);

        if let Some(res_state) = cmd.result.state.as_mut() {
            if let Some(truncated) = &res_state.truncated_state {
                self.state.truncated_state = truncated.clone();
            }
            if let Some(hint) = res_state.gc_hint.take() {
                self.replica.handle_gc_hint(hint);
            }
        }
    }

    /// Handles the second phase of application: writes the applied state key
    /// as the final record of the storage batch, commits it, and publishes
    /// the new state to the replica.
    ///
    /// The applied state key being inside the same atomic batch makes crash
    /// recovery self-healing: if the batch did not land durably, the applied
    /// index did not advance and the entries are simply applied again on
    /// restart; if it did, every side effect landed with it.
    pub fn apply_to_state_machine(&mut self) -> Result<()> {
        // When the batch removes this replica there is nothing left to track;
        // writing the key would resurrect a sliver of the replica.
        if !self.change_removes_replica {
            self.add_applied_state_key_to_batch()?;
        }

        fail_point!("apply_before_commit");

        // Entry application does not sync: atomicity of the batch plus the
        // applied state key make replay after a crash correct. Removal is the
        // exception, since post-destroy cleanup must not run before the
        // deletion is durable.
        let sync = self.change_removes_replica;
        let wb = self.batch.take().expect("batch already committed");
        wb.commit(sync)?;

        let replica = self.replica;
        let cfg = self.store.cfg();
        let (needs_split, needs_merge, needs_truncation, destroyed) = {
            let mut mu = replica.mu.lock();
            mu.state.raft_applied_index = self.state.raft_applied_index;
            mu.state.raft_applied_index_term = self.state.raft_applied_index_term;
            mu.state.lease_applied_index = self.state.lease_applied_index;

            let existing_closed = mu.state.raft_closed_timestamp;
            let new_closed = self.state.raft_closed_timestamp;
            if !new_closed.is_empty()
                && new_closed < existing_closed
                && *RAFT_CLOSEDTS_ASSERTIONS_ENABLED
            {
                return Err(Error::AssertionFailed(format!(
                    "raft closed timestamp regression; replica has {}, new batch has {}",
                    existing_closed, new_closed
                )));
            }
            mu.closed_timestamp_setter = self.closed_timestamp_setter.clone();
            mu.state.raft_closed_timestamp.forward(new_closed);
            mu.state.stats = self.state.stats;
            mu.state.truncated_state = self.state.truncated_state.clone();
            mu.raft_log_size = (mu.raft_log_size + self.raft_log_delta).max(0);

            // If the range shrank back under its maximum size, the memory of
            // larger past maximums is no longer interesting.
            if mu.largest_previous_max_range_size > 0
                && mu.state.stats.total() < cfg.range_max_bytes
            {
                mu.largest_previous_max_range_size = 0;
            }

            (
                mu.needs_split_by_size(cfg),
                mu.needs_merge_by_size(cfg),
                mu.needs_raft_log_truncation(cfg),
                !mu.destroy_status.is_alive(),
            )
        };

        // The split-merge lock is released only now that the subsumed side's
        // deletion is committed.
        self.split_merge_lock = None;

        replica.load_stats.record_write_keys(self.mutations);

        let now = Instant::now();
        if needs_split && replica.split_throttle.should_process(now) {
            self.store.split_queue.push(replica.range_id());
        }
        if needs_merge && replica.merge_throttle.should_process(now) {
            self.store.merge_queue.push(replica.range_id());
        }
        if needs_truncation {
            self.store.raft_log_queue.push(replica.range_id());
        }
        if destroyed {
            self.store.destroyed_queue.push(replica.range_id());
        }

        // The outcome reaches waiting proposers only after it is durable in
        // the sense above.
        for (forced_err, proposal) in self.notifications.drain(..) {
            match forced_err {
                Some(err) => proposal.cb.invoke(Err(err)),
                None => proposal.cb.invoke(Ok(())),
            }
        }

        self.record_stats_on_commit();
        Ok(())
    }

    /// Writes the applied state key, the final record of the batch: the
    /// applied indices, stats and closed timestamp in a single value.
    fn add_applied_state_key_to_batch(&mut self) -> Result<()> {
        let applied = AppliedState {
            raft_applied_index: self.state.raft_applied_index,
            lease_applied_index: self.state.lease_applied_index,
            raft_applied_index_term: self.state.raft_applied_index_term,
            stats: self.state.stats,
            raft_closed_timestamp: self.state.raft_closed_timestamp,
        };
        let wb = self.batch.as_mut().expect("batch already committed");
        write_applied_state(wb, self.replica.range_id(), &applied)
    }

    fn record_stats_on_commit(&mut self) {
        let mut stats = self.replica.apply_stats.lock();
        stats.entries_processed += self.entries;
        stats.entries_processed_bytes += self.entry_bytes;
        stats.num_empty_entries += self.empty_entries;
        stats.batches_processed += 1;
        stats
            .follower_store_write_bytes
            .merge(self.follower_store_write_bytes);

        APPLY_ENTRIES.inc_by(self.entries);
        APPLY_EMPTY_ENTRIES.inc_by(self.empty_entries);
        APPLY_BATCHES.inc();
        FOLLOWER_STORE_WRITE_BYTES
            .with_label_values(&["write"])
            .inc_by(self.follower_store_write_bytes.write_bytes);
        FOLLOWER_STORE_WRITE_BYTES
            .with_label_values(&["ingested"])
            .inc_by(self.follower_store_write_bytes.ingested_bytes);
        APPLY_COMMAND_COMMIT_DURATION.observe(self.start.elapsed().as_secs_f64());
    }

    /// Releases the storage batch if it was not committed. Idempotent.
    pub fn close(&mut self) {
        self.batch = None;
        self.split_merge_lock = None;
        self.notifications.clear();
    }

    /// Asserts that a local intent write stays above the closed timestamp.
    ///
    /// The comparison is against the timestamp closed by *prior* commands: a
    /// command may write under the closed timestamp it itself carries,
    /// because that timestamp is a promise about future proposals, not about
    /// this one.
    fn assert_no_write_below_closed_timestamp(&self, cmd: &ReplicatedCommand) -> Result<()> {
        let applies_timestamp_cache = match &cmd.proposal {
            Some(proposal) => proposal.applies_timestamp_cache,
            // Only the proposing replica still knows the request; remote
            // replicas skip the check.
            None => return Ok(()),
        };
        if !applies_timestamp_cache || !*RAFT_CLOSEDTS_ASSERTIONS_ENABLED {
            return Ok(());
        }
        let write_timestamp = cmd.result.write_timestamp;
        if !write_timestamp.is_empty() && write_timestamp <= self.state.raft_closed_timestamp {
            return Err(Error::AssertionFailed(format!(
                "command writing below closed timestamp; cmd: {}, write ts: {}, batch state \
                 closed: {}, command closed: {:?}, lease: {:?}.\nThis assertion will fire again \
                 on restart; to ignore run with env var {}=false",
                cmd.id,
                write_timestamp,
                self.state.raft_closed_timestamp,
                cmd.closed_timestamp,
                self.state.lease,
                RAFT_CLOSEDTS_ASSERTIONS_VAR,
            )));
        }
        Ok(())
    }

    /// Asserts that the closed timestamp carried by the command is not below
    /// the one carried by prior commands.
    fn assert_no_cmd_closed_timestamp_regression(&self, cmd: &ReplicatedCommand) -> Result<()> {
        if !*RAFT_CLOSEDTS_ASSERTIONS_ENABLED {
            return Ok(());
        }
        let new_closed = match cmd.closed_timestamp {
            Some(ts) if !ts.is_empty() => ts,
            _ => return Ok(()),
        };
        let existing_closed = self.state.raft_closed_timestamp;
        if new_closed < existing_closed {
            let setter = &self.closed_timestamp_setter;
            let log_tail = self
                .replica
                .print_raft_tail(
                    self.store.engine(),
                    ASSERT_LOG_TAIL_MAX_ENTRIES,
                    ASSERT_LOG_TAIL_MAX_CHARS_PER_ENTRY,
                )
                .unwrap_or_else(|e| format!("error printing log: {}", e));
            return Err(Error::AssertionFailed(format!(
                "raft closed timestamp regression in cmd: {} (term: {}, index: {}); batch state: \
                 {}, command: {}, lease: {:?}, applying at lease index: {}.\nClosed timestamp was \
                 set by cmd: {:?} (term: {}, index: {}) under lease: {:?}, at lease index: {}. \
                 Batch idx: {}.\nThis assertion will fire again on restart; to ignore run with \
                 env var {}=false\nRaft log tail:\n{}",
                cmd.id,
                cmd.term,
                cmd.index,
                existing_closed,
                new_closed,
                self.state.lease,
                cmd.lease_index,
                setter.cmd_id,
                setter.term,
                setter.index,
                setter.lease,
                setter.lease_index,
                self.entries,
                RAFT_CLOSEDTS_ASSERTIONS_VAR,
                log_tail,
            )));
        }
        Ok(())
    }
}

/// Normalizes a command, accounting for past migrations: the stats delta may
/// arrive in its pre-migration representation. Carrying both is a malformed
/// command.
fn migrate_replicated_result(tag: &str, cmd: &mut ReplicatedCommand) {
    if let Some(deprecated) = cmd.result.deprecated_delta.take() {
        if cmd.result.delta != Default::default() {
            panic!(
                "{} stats delta not empty but deprecated delta provided: {:?}",
                tag, cmd
            );
        }
        cmd.result.delta = *deprecated;
    }
}

/// A storage-less application batch that performs the bare minimum to decide
/// whether each command would be rejected or applied: the rejection check
/// plus the lease applied index advance it implies.
///
/// The outer scheduler uses it to speculate about rejections before
/// committing to a real application pass; its decisions must therefore match
/// a real batch's exactly over the same commands, which holds because both
/// run the same pure predicate over the same view transitions.
pub struct EphemeralReplicaAppBatch {
    state: ReplicaState,
}

impl EphemeralReplicaAppBatch {
    pub fn new(replica: &Replica) -> EphemeralReplicaAppBatch {
        EphemeralReplicaAppBatch {
            state: replica.state_view(),
        }
    }

    /// Runs the rejection check and advances the view. Returns whether the
    /// command would apply.
    pub fn stage(&mut self, cmd: &mut ReplicatedCommand) -> bool {
        let would_apply = should_apply_command(&self.state, cmd);
        self.state.lease_applied_index = cmd.lease_index;
        would_apply
    }

    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    pub fn close(self) {}
}
