// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::hlc::Timestamp;
use crate::store::rangefeed::LogicalOp;
use crate::store::state::{GcHint, MvccStats, RangeDescriptor, ReplicaId, Span, TruncatedState};
use crate::Result;

/// Opaque identifier assigned to a command at proposal time.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub [u8; 8]);

impl Display for CommandId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for CommandId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// The deterministic rejection verdict attached to a command that must not
/// apply. All replicas reach the identical verdict; only the proposing
/// replica also relays it to the waiting proposer.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ForcedError {
    /// The lease applied index has moved past the command's ceiling; the
    /// proposer may retry under a fresh lease index.
    #[error(
        "command with max lease index {max_lease_index} cannot apply at lease applied index \
         {applied}"
    )]
    LeaseIndexMismatch { max_lease_index: u64, applied: u64 },
    /// Proposed under a lease that is no longer in effect; retry against the
    /// current leaseholder.
    #[error("proposed under lease sequence {proposed}, replica holds sequence {held}")]
    NotLeaseholder {
        proposed: u64,
        held: u64,
        /// Redirect hint.
        leaseholder: ReplicaId,
    },
    /// The command evaluated at a timestamp at or below the GC threshold and
    /// must abort.
    #[error("batch timestamp {write_timestamp} must be after replica GC threshold {threshold}")]
    BatchTimestampBelowGc {
        write_timestamp: Timestamp,
        threshold: Timestamp,
    },
}

impl ForcedError {
    /// A metrics label for the rejection kind.
    pub fn label(&self) -> &'static str {
        match self {
            ForcedError::LeaseIndexMismatch { .. } => "lease_index_mismatch",
            ForcedError::NotLeaseholder { .. } => "not_leaseholder",
            ForcedError::BatchTimestampBelowGc { .. } => "below_gc_threshold",
        }
    }

    /// Whether the proposer may simply re-submit the command. Only lease
    /// index violations are retriable, and only for the local proposer that
    /// still holds the evaluated command.
    pub fn is_retriable(&self, local: bool) -> bool {
        local && matches!(self, ForcedError::LeaseIndexMismatch { .. })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitTrigger {
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeTrigger {
    pub left_desc: RangeDescriptor,
    pub right_desc: RangeDescriptor,
}

/// A membership change. Removal of this store is detected by its absence
/// from the new descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeReplicas {
    pub desc: RangeDescriptor,
}

/// A pre-built sorted file to ingest into the engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddSstable {
    pub data: Vec<u8>,
    pub span: Span,
    /// The file's keys carry the command's write timestamp in a form the
    /// rangefeed can observe, so the ingestion is published to it.
    pub at_write_timestamp: bool,
}

/// Spans whose MVCC history was rewritten in place, invalidating anything a
/// rangefeed may have emitted for them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MvccHistoryMutation {
    pub spans: Vec<Span>,
}

/// Replicated state fields updated as a side effect of a command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub gc_threshold: Option<Timestamp>,
    pub truncated_state: Option<TruncatedState>,
    pub gc_hint: Option<GcHint>,
}

impl StateDelta {
    fn is_empty(&self) -> bool {
        self.gc_threshold.is_none() && self.truncated_state.is_none() && self.gc_hint.is_none()
    }
}

/// The declarative side effects of an evaluated command: a tagged record with
/// independently optional triggers. The applicator visits them in a fixed
/// order; see `ReplicaAppBatch::run_post_staging_triggers`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedResult {
    pub delta: MvccStats,
    /// The pre-migration representation of `delta`. Commands carry at most
    /// one of the two; staging normalizes this into `delta`.
    pub deprecated_delta: Option<Box<MvccStats>>,
    pub split: Option<SplitTrigger>,
    pub merge: Option<MergeTrigger>,
    pub change_replicas: Option<ChangeReplicas>,
    pub add_sstable: Option<AddSstable>,
    pub mvcc_history_mutation: Option<MvccHistoryMutation>,
    pub state: Option<StateDelta>,
    /// The timestamp at which the command's writes were evaluated.
    pub write_timestamp: Timestamp,
    /// First index the truncation proposer expected this replica's log to
    /// have. Zero on commands predating loosely coupled truncation.
    pub raft_expected_first_index: u64,
    /// Log size change implied by the truncation, if any.
    pub raft_log_delta: i64,
}

impl ReplicatedResult {
    /// A trivial result only adjusts accumulator state (stats, timestamps)
    /// and needs no side-effect machinery. Non-trivial commands are staged in
    /// batches of their own.
    pub fn is_trivial(&self) -> bool {
        self.deprecated_delta.is_none()
            && self.split.is_none()
            && self.merge.is_none()
            && self.change_replicas.is_none()
            && self.add_sstable.is_none()
            && self.mvcc_history_mutation.is_none()
            && self.state.as_ref().map_or(true, |s| s.is_empty())
    }
}

/// How the proposer learns the outcome of its command.
pub enum Callback {
    None,
    Applied(Box<dyn FnOnce(std::result::Result<(), ForcedError>) + Send>),
}

impl Callback {
    pub fn invoke(self, result: std::result::Result<(), ForcedError>) {
        match self {
            Callback::None => {}
            Callback::Applied(cb) => cb(result),
        }
    }
}

impl Debug for Callback {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Callback::None => write!(f, "Callback::None"),
            Callback::Applied(_) => write!(f, "Callback::Applied(..)"),
        }
    }
}

/// Present only on the replica that proposed the command and only while the
/// proposer is still waiting; its presence is what makes a command *local*.
#[derive(Debug)]
pub struct Proposal {
    /// Whether the proposed request is an intent write that must respect the
    /// closed timestamp. Requests like lease transfers legitimately operate
    /// below it.
    pub applies_timestamp_cache: bool,
    pub cb: Callback,
}

/// One committed consensus log entry, decoded.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReplicatedCommand {
    pub id: CommandId,
    pub index: u64,
    pub term: u64,
    /// The ceiling assigned at proposal time: the command only applies while
    /// the lease applied index is below it.
    pub max_lease_index: u64,
    /// Sequence number of the lease the proposer held.
    pub proposer_lease_seq: u64,
    /// A promise that no later proposal will write below this timestamp.
    pub closed_timestamp: Option<Timestamp>,
    /// Opaque ordered mutation stream for the engine (see
    /// `storage_engine::raw`).
    pub write_batch: Option<Vec<u8>>,
    pub logical_ops: Option<Vec<LogicalOp>>,
    pub result: ReplicatedResult,

    /// The lease applied index this command carries the view to. Decided by
    /// the rejection check: the command's ceiling if it applies, the view's
    /// previous value if not.
    #[serde(skip)]
    pub lease_index: u64,
    #[serde(skip)]
    pub forced_err: Option<ForcedError>,
    #[serde(skip)]
    pub proposal: Option<Proposal>,
    /// Size of the entry's encoded payload, for accounting only.
    #[serde(skip)]
    pub data_size: u64,
}

impl ReplicatedCommand {
    pub fn is_local(&self) -> bool {
        self.proposal.is_some()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<ReplicatedCommand> {
        let mut cmd: ReplicatedCommand = postcard::from_bytes(data)?;
        cmd.data_size = data.len() as u64;
        Ok(cmd)
    }

    /// Byte sizes this command will write to the store, split into batch
    /// writes and ingested files. Read before triggers clear the ingestion.
    pub fn store_write_byte_sizes(&self) -> (u64, u64) {
        let write_bytes = self.write_batch.as_ref().map_or(0, |wb| wb.len() as u64);
        let ingested_bytes = self
            .result
            .add_sstable
            .as_ref()
            .map_or(0, |sst| sst.data.len() as u64);
        (write_bytes, ingested_bytes)
    }
}
