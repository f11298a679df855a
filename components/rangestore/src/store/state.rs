// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};
use storage_engine::{Mutable, Peekable};

use crate::store::command::{CommandId, ReplicatedCommand};
use crate::store::hlc::Timestamp;
use crate::Result;

pub type RangeId = u64;
pub type StoreId = u64;
pub type ReplicaId = u32;

/// A half-open interval of user keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl Span {
    pub fn new(start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Span {
        Span {
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && key < self.end_key.as_slice()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start_key < other.end_key && other.start_key < self.end_key
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub store_id: StoreId,
    pub replica_id: ReplicaId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub replicas: Vec<ReplicaDescriptor>,
    /// The smallest replica ID that may still be created for this range.
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    pub fn replica_on(&self, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.store_id == store_id)
    }

    pub fn span(&self) -> Span {
        Span::new(self.start_key.clone(), self.end_key.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub sequence: u64,
    /// The replica holding the lease.
    pub replica_id: ReplicaId,
    pub start: Timestamp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncatedState {
    /// The highest log index that has been discarded.
    pub index: u64,
    pub term: u64,
}

/// A hint left by bulk deletions so that garbage collection can prioritize
/// the range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcHint {
    pub latest_range_delete_timestamp: Timestamp,
}

/// MVCC size statistics of a replica. Fields are signed so the same type
/// serves as an absolute value and as a delta; deltas add commutatively,
/// which the latch manager above exploits to avoid serializing on the stats
/// key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccStats {
    pub live_bytes: i64,
    pub live_count: i64,
    pub key_bytes: i64,
    pub key_count: i64,
    pub val_bytes: i64,
    pub val_count: i64,
    pub intent_bytes: i64,
    pub intent_count: i64,
    pub sys_bytes: i64,
    pub sys_count: i64,
}

impl MvccStats {
    pub fn add(&mut self, delta: &MvccStats) {
        self.live_bytes += delta.live_bytes;
        self.live_count += delta.live_count;
        self.key_bytes += delta.key_bytes;
        self.key_count += delta.key_count;
        self.val_bytes += delta.val_bytes;
        self.val_count += delta.val_count;
        self.intent_bytes += delta.intent_bytes;
        self.intent_count += delta.intent_count;
        self.sys_bytes += delta.sys_bytes;
        self.sys_count += delta.sys_count;
    }

    pub fn subtract(&mut self, delta: &MvccStats) {
        self.live_bytes -= delta.live_bytes;
        self.live_count -= delta.live_count;
        self.key_bytes -= delta.key_bytes;
        self.key_count -= delta.key_count;
        self.val_bytes -= delta.val_bytes;
        self.val_count -= delta.val_count;
        self.intent_bytes -= delta.intent_bytes;
        self.intent_count -= delta.intent_count;
        self.sys_bytes -= delta.sys_bytes;
        self.sys_count -= delta.sys_count;
    }

    /// Total logical byte size of the replica.
    pub fn total(&self) -> i64 {
        self.key_bytes + self.val_bytes
    }
}

/// The replicated state of one replica, as visible to the application batch.
///
/// The batch copies this from under the replica lock when it is created and
/// mutates only its own copy; the live replica state is swapped at commit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub desc: RangeDescriptor,
    pub lease: Lease,
    pub raft_applied_index: u64,
    pub raft_applied_index_term: u64,
    pub lease_applied_index: u64,
    pub stats: MvccStats,
    pub truncated_state: TruncatedState,
    pub raft_closed_timestamp: Timestamp,
    pub gc_threshold: Timestamp,
}

/// The value of the applied state key: everything that must advance
/// atomically with the effects of an application batch, in a single record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedState {
    pub raft_applied_index: u64,
    pub lease_applied_index: u64,
    pub raft_applied_index_term: u64,
    pub stats: MvccStats,
    pub raft_closed_timestamp: Timestamp,
}

/// Raft vote state of a replica. It is replica-local, never replicated:
/// votes may have been cast before the replica was initialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

/// Records which command most recently advanced the closed timestamp. Used
/// only to decorate closed timestamp regression assertions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClosedTimestampSetterInfo {
    pub cmd_id: Option<CommandId>,
    pub index: u64,
    pub term: u64,
    pub lease_index: u64,
    /// The lease under which the setter applied.
    pub lease: Option<Lease>,
}

impl ClosedTimestampSetterInfo {
    pub(crate) fn record(&mut self, cmd: &ReplicatedCommand, lease: &Lease) {
        self.cmd_id = Some(cmd.id);
        self.index = cmd.index;
        self.term = cmd.term;
        self.lease_index = cmd.lease_index;
        self.lease = Some(lease.clone());
    }
}

pub fn write_applied_state<B: Mutable>(
    wb: &mut B,
    range_id: RangeId,
    state: &AppliedState,
) -> Result<()> {
    let value = postcard::to_allocvec(state)?;
    wb.put(&keys::applied_state_key(range_id), &value)?;
    Ok(())
}

pub fn load_applied_state<R: Peekable>(
    reader: &R,
    range_id: RangeId,
) -> Result<Option<AppliedState>> {
    match reader.get_value(&keys::applied_state_key(range_id))? {
        Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
        None => Ok(None),
    }
}

pub fn write_hard_state<B: Mutable>(
    wb: &mut B,
    range_id: RangeId,
    state: &HardState,
) -> Result<()> {
    let value = postcard::to_allocvec(state)?;
    wb.put(&keys::hard_state_key(range_id), &value)?;
    Ok(())
}

pub fn load_hard_state<R: Peekable>(reader: &R, range_id: RangeId) -> Result<Option<HardState>> {
    match reader.get_value(&keys::hard_state_key(range_id))? {
        Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
        None => Ok(None),
    }
}

pub fn write_truncated_state<B: Mutable>(
    wb: &mut B,
    range_id: RangeId,
    state: &TruncatedState,
) -> Result<()> {
    let value = postcard::to_allocvec(state)?;
    wb.put(&keys::truncated_state_key(range_id), &value)?;
    Ok(())
}

pub fn load_truncated_state<R: Peekable>(
    reader: &R,
    range_id: RangeId,
) -> Result<Option<TruncatedState>> {
    match reader.get_value(&keys::truncated_state_key(range_id))? {
        Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
        None => Ok(None),
    }
}

/// Writes the removal tombstone. Its value is the smallest replica ID that
/// may be recreated for this range on this store.
pub fn write_tombstone<B: Mutable>(
    wb: &mut B,
    range_id: RangeId,
    next_replica_id: ReplicaId,
) -> Result<()> {
    let value = postcard::to_allocvec(&next_replica_id)?;
    wb.put(&keys::tombstone_key(range_id), &value)?;
    Ok(())
}

pub fn load_tombstone<R: Peekable>(reader: &R, range_id: RangeId) -> Result<Option<ReplicaId>> {
    match reader.get_value(&keys::tombstone_key(range_id))? {
        Some(value) => Ok(Some(postcard::from_bytes(&value)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use storage_engine::{StorageBatch, StorageEngine};
    use storage_mem::MemEngine;

    use super::*;

    #[test]
    fn test_stats_add_subtract() {
        let mut stats = MvccStats {
            key_bytes: 10,
            val_bytes: 20,
            key_count: 1,
            ..Default::default()
        };
        let delta = MvccStats {
            key_bytes: 5,
            val_bytes: -3,
            key_count: 2,
            ..Default::default()
        };
        stats.add(&delta);
        assert_eq!(stats.key_bytes, 15);
        assert_eq!(stats.val_bytes, 17);
        assert_eq!(stats.key_count, 3);
        assert_eq!(stats.total(), 32);
        stats.subtract(&delta);
        assert_eq!(stats.total(), 30);
        assert_eq!(stats.key_count, 1);
    }

    #[test]
    fn test_applied_state_roundtrip() {
        let engine = MemEngine::new();
        let state = AppliedState {
            raft_applied_index: 42,
            lease_applied_index: 17,
            raft_applied_index_term: 6,
            stats: MvccStats {
                key_bytes: 100,
                ..Default::default()
            },
            raft_closed_timestamp: Timestamp::new(1000, 1),
        };
        let mut wb = engine.write_batch();
        write_applied_state(&mut wb, 3, &state).unwrap();
        wb.commit(true).unwrap();

        assert_eq!(load_applied_state(&engine, 3).unwrap().unwrap(), state);
        assert_eq!(load_applied_state(&engine, 4).unwrap(), None);
    }

    #[test]
    fn test_hard_state_and_tombstone_roundtrip() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        let hs = HardState {
            term: 5,
            vote: 2,
            commit: 10,
        };
        write_hard_state(&mut wb, 9, &hs).unwrap();
        write_tombstone(&mut wb, 9, 7).unwrap();
        write_truncated_state(
            &mut wb,
            9,
            &TruncatedState { index: 10, term: 5 },
        )
        .unwrap();
        wb.commit(true).unwrap();

        assert_eq!(load_hard_state(&engine, 9).unwrap().unwrap(), hs);
        assert_eq!(load_tombstone(&engine, 9).unwrap().unwrap(), 7);
        assert_eq!(
            load_truncated_state(&engine, 9).unwrap().unwrap(),
            TruncatedState { index: 10, term: 5 }
        );
    }

    #[test]
    fn test_span_overlap() {
        let ab = Span::new(b"a".to_vec(), b"b".to_vec());
        let bc = Span::new(b"b".to_vec(), b"c".to_vec());
        let az = Span::new(b"a".to_vec(), b"z".to_vec());
        assert!(!ab.overlaps(&bc));
        assert!(ab.overlaps(&az));
        assert!(az.overlaps(&bc));
        assert!(az.contains(b"m"));
        assert!(!az.contains(b"z"));
    }

    #[test]
    fn test_descriptor_replica_on() {
        let desc = RangeDescriptor {
            range_id: 1,
            replicas: vec![
                ReplicaDescriptor {
                    store_id: 1,
                    replica_id: 1,
                },
                ReplicaDescriptor {
                    store_id: 2,
                    replica_id: 4,
                },
            ],
            ..Default::default()
        };
        assert_eq!(desc.replica_on(2).unwrap().replica_id, 4);
        assert!(desc.replica_on(3).is_none());
    }
}
