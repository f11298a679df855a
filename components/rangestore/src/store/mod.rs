// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

mod apply;
mod command;
mod config;
mod hlc;
pub mod metrics;
mod rangefeed;
mod replica;
mod sideload;
mod split;
mod state;
mod store;
mod truncate;
mod util;

pub use self::apply::{
    check_forced_err, ApplyStats, EphemeralReplicaAppBatch, FollowerStoreWriteBytes,
    ReplicaAppBatch, MERGED_TOMBSTONE_REPLICA_ID, RAFT_CLOSEDTS_ASSERTIONS_VAR,
};
pub use self::command::{
    AddSstable, Callback, ChangeReplicas, CommandId, ForcedError, MergeTrigger, MvccHistoryMutation,
    Proposal, ReplicatedCommand, ReplicatedResult, SplitTrigger, StateDelta,
};
pub use self::config::Config;
pub use self::hlc::Timestamp;
pub use self::rangefeed::{
    LogicalOp, LogicalOpKind, RangefeedError, RangefeedEvent, RangefeedRetryReason,
};
pub use self::replica::{
    DestroyReason, DestroyStatus, RaftLocked, Replica, ReplicaMu, SplitMergeLock,
};
pub use self::split::{RAFT_INITIAL_LOG_INDEX, RAFT_INITIAL_LOG_TERM};
pub use self::state::{
    load_applied_state, load_hard_state, load_tombstone, load_truncated_state,
    AppliedState, ClosedTimestampSetterInfo, GcHint, HardState, Lease, MvccStats, RangeDescriptor,
    RangeId, ReplicaDescriptor, ReplicaId, ReplicaState, Span, StoreId, TruncatedState,
};
pub use self::store::{QueueSignal, Store};
pub use self::truncate::{PendingTruncation, RaftLogTruncator};
pub use self::util::Throttle;
