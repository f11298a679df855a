// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Crash-recovery behavior of the application batch: because the applied
//! state key commits atomically with a batch's effects, losing an unsynced
//! batch only rewinds the applied index, and replaying the same log entries
//! reconverges on the identical state.

use std::sync::Arc;

use storage_engine::{Iterable, Peekable};
use storage_mem::MemEngine;
use tempfile::TempDir;

use rangestore::store::{
    load_applied_state, load_tombstone, Config, Lease, MvccStats, RangeDescriptor, RangeId,
    Replica, ReplicaAppBatch, ReplicaDescriptor, ReplicaState, ReplicatedCommand, Store, Timestamp,
    TruncatedState,
};

fn ts(wall: u64) -> Timestamp {
    Timestamp::new(wall, 0)
}

fn new_desc(range_id: RangeId) -> RangeDescriptor {
    RangeDescriptor {
        range_id,
        start_key: b"a".to_vec(),
        end_key: b"z".to_vec(),
        replicas: vec![
            ReplicaDescriptor {
                store_id: 1,
                replica_id: 1,
            },
            ReplicaDescriptor {
                store_id: 2,
                replica_id: 2,
            },
        ],
        next_replica_id: 3,
    }
}

fn initial_state() -> ReplicaState {
    ReplicaState {
        desc: new_desc(1),
        lease: Lease {
            sequence: 3,
            replica_id: 1,
            start: ts(1),
        },
        raft_applied_index: 10,
        raft_applied_index_term: 5,
        lease_applied_index: 5,
        stats: MvccStats::default(),
        truncated_state: TruncatedState { index: 3, term: 5 },
        raft_closed_timestamp: ts(1000),
        gc_threshold: ts(100),
    }
}

struct Node {
    _dir: TempDir,
    store: Store<MemEngine>,
    replica: Arc<Replica>,
}

fn new_node(engine: MemEngine) -> Node {
    let dir = TempDir::new().unwrap();
    let store = Store::new(1, engine, Config::default()).unwrap();
    let replica = Arc::new(Replica::new(
        1,
        1,
        1,
        store.cfg(),
        initial_state(),
        dir.path().join("sideloaded"),
    ));
    store.insert_replica(replica.clone());
    Node {
        _dir: dir,
        store,
        replica,
    }
}

fn encode_entries() -> Vec<Vec<u8>> {
    let delta = MvccStats {
        key_bytes: 8,
        val_bytes: 16,
        key_count: 2,
        ..Default::default()
    };
    let put = |key: &[u8], value: &[u8]| {
        storage_engine::raw::encode(&[storage_engine::raw::RawMutation::Put {
            key: keys::data_key(key),
            value: value.to_vec(),
        }])
    };
    let mut cmds = vec![];
    let mut cmd = ReplicatedCommand {
        index: 11,
        term: 6,
        max_lease_index: 11,
        proposer_lease_seq: 3,
        closed_timestamp: Some(ts(1100)),
        write_batch: Some(put(b"k1", b"v1")),
        ..Default::default()
    };
    cmd.result.delta = delta;
    cmds.push(cmd);
    let mut cmd = ReplicatedCommand {
        index: 12,
        term: 6,
        max_lease_index: 12,
        proposer_lease_seq: 3,
        closed_timestamp: Some(ts(1200)),
        write_batch: Some(put(b"k2", b"v2")),
        ..Default::default()
    };
    cmd.result.delta = delta;
    cmds.push(cmd);
    cmds.iter().map(|c| c.encode().unwrap()).collect()
}

fn apply_entries(node: &Node, entries: &[Vec<u8>]) {
    let raft_mu = node.replica.raft_mu.clone();
    let mut raft = raft_mu.lock();
    let mut batch = ReplicaAppBatch::new(&node.store, &node.replica, &mut raft);
    for data in entries {
        let mut cmd = ReplicatedCommand::decode(data).unwrap();
        batch.stage(&mut cmd).unwrap();
    }
    batch.apply_to_state_machine().unwrap();
    batch.close();
}

fn engine_contents(engine: &MemEngine) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut contents = vec![];
    engine
        .scan(&[0], &[0xff], &mut |k, v| {
            contents.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })
        .unwrap();
    contents
}

#[test]
fn test_unsynced_batch_replays_to_identical_state() {
    let entries = encode_entries();

    // Reference run with no crash.
    let reference = new_node(MemEngine::new());
    apply_entries(&reference, &entries);
    let want_applied = load_applied_state(reference.store.engine(), 1)
        .unwrap()
        .unwrap();
    let want_contents = engine_contents(reference.store.engine());

    // Crashing run: the unsynced batch is lost wholesale, applied state key
    // included, so recovery simply starts over from the initial state.
    let engine = MemEngine::new();
    let crashed = new_node(engine.clone());
    apply_entries(&crashed, &entries);
    engine.crash();
    assert_eq!(load_applied_state(&engine, 1).unwrap(), None);
    assert_eq!(engine.get_value(&keys::data_key(b"k1")).unwrap(), None);

    // Replay after restart, against a fresh replica loaded with the on-disk
    // (here: initial) state.
    let recovered = new_node(engine.clone());
    apply_entries(&recovered, &entries);

    assert_eq!(
        load_applied_state(&engine, 1).unwrap().unwrap(),
        want_applied
    );
    assert_eq!(engine_contents(&engine), want_contents);
    assert_eq!(want_applied.raft_applied_index, 12);
    assert_eq!(want_applied.raft_closed_timestamp, ts(1200));
    assert_eq!(
        recovered.replica.state_view().stats,
        reference.replica.state_view().stats
    );
}

#[test]
fn test_clean_shutdown_preserves_unsynced_batch() {
    let entries = encode_entries();
    let engine = MemEngine::new();
    let node = new_node(engine.clone());
    apply_entries(&node, &entries);

    // A clean shutdown lands the unsynced commit; a later crash must not
    // rewind it.
    engine.flush();
    engine.crash();

    let applied = load_applied_state(&engine, 1).unwrap().unwrap();
    assert_eq!(applied.raft_applied_index, 12);
    assert_eq!(
        engine.get_value(&keys::data_key(b"k2")).unwrap().unwrap(),
        b"v2"
    );
}

#[test]
fn test_removal_is_durable_without_flush() {
    let engine = MemEngine::new();
    let node = new_node(engine.clone());
    apply_entries(&node, &encode_entries());

    // Remove this store from the descriptor.
    let mut desc = new_desc(1);
    desc.replicas.retain(|r| r.store_id != 1);
    let mut cmd = ReplicatedCommand {
        index: 13,
        term: 6,
        max_lease_index: 13,
        proposer_lease_seq: 3,
        ..Default::default()
    };
    cmd.result.change_replicas = Some(rangestore::store::ChangeReplicas { desc });
    let data = cmd.encode().unwrap();

    let raft_mu = node.replica.raft_mu.clone();
    let mut raft = raft_mu.lock();
    let mut batch = ReplicaAppBatch::new(&node.store, &node.replica, &mut raft);
    let mut cmd = ReplicatedCommand::decode(&data).unwrap();
    batch.stage(&mut cmd).unwrap();
    batch.apply_to_state_machine().unwrap();
    drop(batch);
    drop(raft);

    // Removal commits synced: even an immediate crash leaves no replica
    // data, only the tombstone.
    engine.crash();
    assert_eq!(load_applied_state(&engine, 1).unwrap(), None);
    assert_eq!(engine.get_value(&keys::data_key(b"k1")).unwrap(), None);
    assert_eq!(load_tombstone(&engine, 1).unwrap(), Some(3));
    assert!(node.replica.is_destroyed());

    let applied_state_key = keys::applied_state_key(1);
    assert_eq!(engine.get_value(&applied_state_key).unwrap(), None);
}
