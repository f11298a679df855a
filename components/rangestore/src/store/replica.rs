// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use slog_global::info;
use storage_engine::{Iterable, Mutable, Peekable, StorageEngine};

use crate::store::command::ReplicatedResult;
use crate::store::config::Config;
use crate::store::hlc::Timestamp;
use crate::store::rangefeed::{
    LogicalOp, LogicalOpKind, RangefeedError, RangefeedEvent, RangefeedProcessor,
    RangefeedRetryReason,
};
use crate::store::state::{
    write_tombstone, ClosedTimestampSetterInfo, GcHint, RangeDescriptor, RangeId, ReplicaId,
    ReplicaState, Span, StoreId,
};
use crate::store::store::Store;
use crate::store::util::{clip_chars, Throttle};
use crate::store::{apply::ApplyStats, command::ReplicatedCommand};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DestroyReason {
    #[default]
    Alive,
    Removed,
}

/// Whether the replica still accepts commands. Set under both the read-only
/// command mutex and the replica inner lock so that reads and proposals
/// observe the transition consistently.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DestroyStatus {
    pub reason: DestroyReason,
    pub err: Option<String>,
}

impl DestroyStatus {
    pub fn is_alive(&self) -> bool {
        self.reason == DestroyReason::Alive
    }

    pub fn set(&mut self, reason: DestroyReason, err: String) {
        self.reason = reason;
        self.err = Some(err);
    }
}

/// State guarded by the raft mutex, the coarse per-replica lock serializing
/// all raft-driven mutation. The caller of the application batch holds it for
/// the whole batch.
pub struct RaftLocked {
    /// Directory holding sideloaded SSTable files for this replica.
    pub sideloaded: PathBuf,
}

/// State guarded by the replica inner lock, which is only held briefly.
pub struct ReplicaMu {
    pub state: ReplicaState,
    pub destroy_status: DestroyStatus,
    pub closed_timestamp_setter: ClosedTimestampSetterInfo,
    pub gc_hint: GcHint,
    /// High-water mark of past `range_max_bytes` values, kept so that a
    /// shrinking range is not immediately re-queued for splitting. Cleared
    /// once the range drops below the current maximum.
    pub largest_previous_max_range_size: i64,
    pub raft_log_size: i64,
    /// False when this replica skipped a truncation and its log size
    /// bookkeeping can no longer be trusted.
    pub raft_log_size_trusted: bool,
}

impl ReplicaMu {
    pub(crate) fn needs_split_by_size(&self, cfg: &Config) -> bool {
        self.state.stats.total() > cfg.range_max_bytes
    }

    pub(crate) fn needs_merge_by_size(&self, cfg: &Config) -> bool {
        self.state.stats.total() < cfg.range_min_bytes
    }

    pub(crate) fn needs_raft_log_truncation(&self, cfg: &Config) -> bool {
        !self.raft_log_size_trusted || self.raft_log_size > cfg.raft_log_size_soft_limit
    }
}

#[derive(Default)]
pub(crate) struct LoadStats {
    write_keys: AtomicU64,
}

impl LoadStats {
    pub fn record_write_keys(&self, count: u64) {
        self.write_keys.fetch_add(count, Ordering::Relaxed);
    }

    pub fn write_keys(&self) -> u64 {
        self.write_keys.load(Ordering::Relaxed)
    }
}

/// One copy of a range on this store.
///
/// Replicas live in the store's replica map keyed by range ID; they refer
/// back to their store by ID, never by ownership.
pub struct Replica {
    range_id: RangeId,
    replica_id: ReplicaId,
    store_id: StoreId,
    tag: String,

    /// Coarse lock serializing raft-driven mutation; held across a whole
    /// application batch. Behind an `Arc` so a merge can keep the right-hand
    /// side's mutex locked across commit.
    pub raft_mu: Arc<Mutex<RaftLocked>>,
    pub mu: Mutex<ReplicaMu>,
    /// Held around destroy-status transitions to keep the read path in sync.
    pub read_only_cmd_mu: Mutex<()>,

    rangefeed: Mutex<Option<RangefeedProcessor>>,
    pub(crate) split_throttle: Throttle,
    pub(crate) merge_throttle: Throttle,
    pub(crate) load_stats: LoadStats,
    pub(crate) apply_stats: Mutex<ApplyStats>,
}

impl Replica {
    pub fn new(
        range_id: RangeId,
        replica_id: ReplicaId,
        store_id: StoreId,
        cfg: &Config,
        state: ReplicaState,
        sideloaded: PathBuf,
    ) -> Replica {
        let throttle = Duration::from_millis(cfg.queue_throttle_interval_ms);
        Replica {
            range_id,
            replica_id,
            store_id,
            tag: format!("[range {}] {}", range_id, replica_id),
            raft_mu: Arc::new(Mutex::new(RaftLocked { sideloaded })),
            mu: Mutex::new(ReplicaMu {
                state,
                destroy_status: DestroyStatus::default(),
                closed_timestamp_setter: ClosedTimestampSetterInfo::default(),
                gc_hint: GcHint::default(),
                largest_previous_max_range_size: 0,
                raft_log_size: 0,
                raft_log_size_trusted: true,
            }),
            read_only_cmd_mu: Mutex::new(()),
            rangefeed: Mutex::new(None),
            split_throttle: Throttle::new(throttle),
            merge_throttle: Throttle::new(throttle),
            load_stats: LoadStats::default(),
            apply_stats: Mutex::new(ApplyStats::default()),
        }
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Copies the replicated state under the inner lock, for batch
    /// construction.
    pub fn state_view(&self) -> ReplicaState {
        self.mu.lock().state.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        !self.mu.lock().destroy_status.is_alive()
    }

    pub fn gc_hint(&self) -> GcHint {
        self.mu.lock().gc_hint
    }

    /// Marks the replica as destroyed so that no new commands are accepted.
    /// The removal itself is finished after the batch carrying it commits.
    pub(crate) fn mark_destroyed(&self, err: String) {
        let _read_guard = self.read_only_cmd_mu.lock();
        let mut mu = self.mu.lock();
        mu.destroy_status.set(DestroyReason::Removed, err);
    }

    /// Publishes a GC threshold bump. Called before the batch carrying the
    /// bump commits, so that reads validating an engine snapshot against the
    /// threshold observe it first and fail instead of reading GC'ed state.
    pub(crate) fn handle_gc_threshold(&self, threshold: Timestamp) {
        let mut mu = self.mu.lock();
        if mu.state.gc_threshold.forward(threshold) {
            info!(
                "gc threshold advanced";
                "range_id" => self.range_id,
                "replica_id" => self.replica_id,
                "threshold" => %threshold,
            );
        }
    }

    pub(crate) fn handle_gc_hint(&self, hint: GcHint) {
        self.mu
            .lock()
            .gc_hint
            .latest_range_delete_timestamp
            .forward(hint.latest_range_delete_timestamp);
    }

    pub fn register_rangefeed(&self, span: Span) -> Receiver<RangefeedEvent> {
        let mut guard = self.rangefeed.lock();
        guard
            .get_or_insert_with(|| RangefeedProcessor::new(self.range_id))
            .register(span)
    }

    pub(crate) fn disconnect_rangefeed(&self, reason: RangefeedRetryReason) {
        if let Some(mut processor) = self.rangefeed.lock().take() {
            info!(
                "disconnecting rangefeed";
                "range_id" => self.range_id,
                "replica_id" => self.replica_id,
                "reason" => %reason,
            );
            processor.disconnect_all(RangefeedError::Retry(reason));
        }
    }

    pub(crate) fn disconnect_rangefeed_span(&self, span: &Span, err: RangefeedError) {
        if let Some(processor) = self.rangefeed.lock().as_mut() {
            processor.disconnect_span(span, err);
        }
    }

    pub(crate) fn handle_logical_ops(&self, ops: Vec<LogicalOp>) {
        if let Some(processor) = self.rangefeed.lock().as_mut() {
            processor.publish_ops(ops);
        }
    }

    pub(crate) fn handle_sst_ingest(&self, span: Span, write_timestamp: Timestamp) {
        if let Some(processor) = self.rangefeed.lock().as_mut() {
            processor.publish_sst(span, write_timestamp);
        }
    }

    /// Fills in previous values for the mutations of a logical op log,
    /// reading through `reader` so that earlier commands in the same batch
    /// are observed.
    pub(crate) fn populate_prev_values<R: Peekable>(
        &self,
        ops: &mut [LogicalOp],
        reader: &R,
    ) -> Result<()> {
        if self.rangefeed.lock().is_none() {
            return Ok(());
        }
        for op in ops {
            if op.kind == LogicalOpKind::MvccWrite && op.prev_value.is_none() {
                op.prev_value = reader.get_value(&keys::data_key(&op.key))?;
            }
        }
        Ok(())
    }

    /// Stages deletion of this replica's local data into `wb` and leaves a
    /// tombstone preventing re-creation below `next_replica_id`. With
    /// `range_id_local_only`, the addressable data stays behind (it now
    /// belongs to the subsuming range).
    pub(crate) fn pre_destroy_raft_mu_locked<B: Mutable>(
        &self,
        wb: &mut B,
        next_replica_id: ReplicaId,
        range_id_local_only: bool,
        desc: &RangeDescriptor,
    ) -> Result<()> {
        let (start, end) = keys::range_id_local_span(self.range_id);
        wb.delete_range(&start, &end)?;
        if !range_id_local_only {
            let (start, end) = keys::range_local_span(&desc.start_key, &desc.end_key);
            wb.delete_range(&start, &end)?;
            let (start, end) = keys::data_span(&desc.start_key, &desc.end_key);
            wb.delete_range(&start, &end)?;
        }
        // Staged after the deletions, so it survives them in the batch.
        write_tombstone(wb, self.range_id, next_replica_id)?;
        Ok(())
    }

    /// Renders the newest raft log entries for diagnostics, newest last.
    pub(crate) fn print_raft_tail<E: StorageEngine>(
        &self,
        engine: &E,
        max_entries: usize,
        max_chars_per_entry: usize,
    ) -> Result<String> {
        let (start, end) = keys::raft_log_span(self.range_id);
        let mut tail: Vec<(u64, String)> = vec![];
        engine.scan(&start, &end, &mut |key, value| {
            let index = keys::raft_log_index(key).map_err(|e| {
                storage_engine::Error::Engine(format!("unexpected key in raft log: {}", e))
            })?;
            let rendered = match ReplicatedCommand::decode(value) {
                Ok(cmd) => format!("{:?}", cmd),
                Err(e) => format!("<failed to decode entry: {}>", e),
            };
            if tail.len() == max_entries {
                tail.remove(0);
            }
            tail.push((index, rendered));
            Ok(true)
        })?;
        let mut out = String::new();
        for (index, rendered) in &tail {
            out.push_str(&format!(
                "{}: {}\n",
                index,
                clip_chars(rendered, max_chars_per_entry)
            ));
        }
        Ok(out)
    }
}

/// Holds the right-hand-side replica's raft mutex across a split or merge.
/// Acquired while staging the command and released only after the batch
/// commits.
pub struct SplitMergeLock {
    pub(crate) rhs: Arc<Replica>,
    _guard: ArcMutexGuard<RawMutex, RaftLocked>,
}

impl SplitMergeLock {
    pub(crate) fn assert_held(&self, rhs: &Replica) {
        assert_eq!(self.rhs.range_id(), rhs.range_id());
        assert!(rhs.raft_mu.is_locked());
    }
}

/// Acquires the split or merge lock for a command, if its result carries the
/// corresponding trigger. For a merge the right-hand side must exist on this
/// store; for a split it may not have been created yet, in which case there
/// is nothing to lock.
pub(crate) fn maybe_acquire_split_merge_lock<E: StorageEngine>(
    store: &Store<E>,
    result: &ReplicatedResult,
) -> Result<Option<SplitMergeLock>> {
    let rhs_range_id = if let Some(split) = &result.split {
        match store.get_replica(split.right_desc.range_id) {
            Ok(_) => split.right_desc.range_id,
            Err(Error::RangeNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
    } else if let Some(merge) = &result.merge {
        merge.right_desc.range_id
    } else {
        return Ok(None);
    };
    let rhs = store.get_replica(rhs_range_id)?;
    let guard = rhs.raft_mu.lock_arc();
    Ok(Some(SplitMergeLock { rhs, _guard: guard }))
}
