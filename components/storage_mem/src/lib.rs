// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! An ordered in-memory engine implementing the [`storage_engine`] traits.
//!
//! The engine keeps an undo journal of unsynced mutations so that tests can
//! exercise the crash-recovery contract of the application core: `crash()`
//! rolls back everything since the last synced commit, modelling a power
//! failure, while dropping the engine normally models a clean shutdown.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use storage_engine::raw::{self, RawMutation};
use storage_engine::{
    Error, ImportExt, Iterable, Mutable, Peekable, Result, Snapshot, StorageBatch, StorageEngine,
};

#[derive(Clone, Default)]
pub struct MemEngine {
    core: Arc<RwLock<MemCore>>,
}

#[derive(Default)]
struct MemCore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    // Undo records for mutations that have not been synced, newest last.
    journal: Vec<UndoRecord>,
}

struct UndoRecord {
    key: Vec<u8>,
    prev: Option<Vec<u8>>,
}

impl MemEngine {
    pub fn new() -> MemEngine {
        MemEngine::default()
    }

    /// Drops every mutation since the last synced commit, as a power failure
    /// would.
    pub fn crash(&self) {
        let mut core = self.core.write();
        while let Some(rec) = core.journal.pop() {
            match rec.prev {
                Some(v) => core.map.insert(rec.key, v),
                None => core.map.remove(&rec.key),
            };
        }
    }

    /// Makes all committed mutations durable, as a clean shutdown would.
    pub fn flush(&self) {
        self.core.write().journal.clear();
    }

    fn apply(&self, mutations: Vec<RawMutation>, sync: bool) {
        let mut core = self.core.write();
        for m in mutations {
            match m {
                RawMutation::Put { key, value } => core.record_and_put(key, Some(value)),
                RawMutation::Delete { key } => core.record_and_put(key, None),
                RawMutation::DeleteRange { begin_key, end_key } => {
                    let doomed: Vec<_> = core
                        .map
                        .range(begin_key..end_key)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        core.record_and_put(key, None);
                    }
                }
            }
        }
        if sync {
            core.journal.clear();
        }
    }
}

impl MemCore {
    fn record_and_put(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let prev = match &value {
            Some(v) => self.map.insert(key.clone(), v.clone()),
            None => self.map.remove(&key),
        };
        self.journal.push(UndoRecord { key, prev });
    }
}

impl Debug for MemEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let core = self.core.read();
        f.debug_struct("MemEngine")
            .field("keys", &core.map.len())
            .field("unsynced", &core.journal.len())
            .finish()
    }
}

impl Peekable for MemEngine {
    fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.core.read().map.get(key).cloned())
    }
}

impl Iterable for MemEngine {
    fn scan(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let core = self.core.read();
        for (k, v) in core.map.range(start_key.to_vec()..end_key.to_vec()) {
            if !f(k, v)? {
                break;
            }
        }
        Ok(())
    }
}

impl ImportExt for MemEngine {
    fn ingest_external_file(&self, path: &Path) -> Result<()> {
        let data = fs::read(path)?;
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = postcard::from_bytes(&data)
            .map_err(|e| Error::Engine(format!("malformed external file {:?}: {}", path, e)))?;
        let mutations = pairs
            .into_iter()
            .map(|(key, value)| RawMutation::Put { key, value })
            .collect();
        // Ingested data shares the journal with batch commits so that a crash
        // rolls the ingestion back together with the command that carried it;
        // replay then re-ingests the file.
        self.apply(mutations, false);
        Ok(())
    }
}

impl StorageEngine for MemEngine {
    type Batch = MemBatch;
    type Snapshot = MemSnapshot;

    fn write_batch(&self) -> MemBatch {
        MemBatch {
            engine: self.clone(),
            ops: vec![],
            pending: BTreeMap::new(),
            data_size: 0,
        }
    }

    fn snapshot(&self) -> MemSnapshot {
        MemSnapshot {
            map: Arc::new(self.core.read().map.clone()),
        }
    }
}

/// Writes an external file in the format `ingest_external_file` expects.
pub fn write_external_file(path: &Path, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
    let data = postcard::to_allocvec(&pairs.to_vec())
        .map_err(|e| Error::Engine(format!("encode external file: {}", e)))?;
    fs::write(path, data)?;
    Ok(())
}

pub struct MemBatch {
    engine: MemEngine,
    ops: Vec<RawMutation>,
    // Read-through overlay: Some(v) shadows the engine, None is a tombstone.
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    data_size: usize,
}

impl MemBatch {
    fn shadow(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        self.pending.insert(key, value);
    }
}

impl Mutable for MemBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data_size += key.len() + value.len();
        self.ops.push(RawMutation::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self.shadow(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data_size += key.len();
        self.ops.push(RawMutation::Delete { key: key.to_vec() });
        self.shadow(key.to_vec(), None);
        Ok(())
    }

    fn delete_range(&mut self, begin_key: &[u8], end_key: &[u8]) -> Result<()> {
        self.data_size += begin_key.len() + end_key.len();
        self.ops.push(RawMutation::DeleteRange {
            begin_key: begin_key.to_vec(),
            end_key: end_key.to_vec(),
        });
        // Tombstone everything currently visible in the range, from the
        // engine and from earlier mutations in this batch.
        let mut doomed: Vec<Vec<u8>> = vec![];
        {
            let core = self.engine.core.read();
            doomed.extend(
                core.map
                    .range(begin_key.to_vec()..end_key.to_vec())
                    .map(|(k, _)| k.clone()),
            );
        }
        doomed.extend(
            self.pending
                .range(begin_key.to_vec()..end_key.to_vec())
                .filter(|(_, v)| v.is_some())
                .map(|(k, _)| k.clone()),
        );
        for key in doomed {
            self.shadow(key, None);
        }
        Ok(())
    }
}

impl Peekable for MemBatch {
    fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.pending.get(key) {
            return Ok(v.clone());
        }
        self.engine.get_value(key)
    }
}

impl StorageBatch for MemBatch {
    fn data_size(&self) -> usize {
        self.data_size
    }

    fn count(&self) -> usize {
        self.ops.len()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn clear(&mut self) {
        self.ops.clear();
        self.pending.clear();
        self.data_size = 0;
    }

    fn apply_raw(&mut self, data: &[u8]) -> Result<()> {
        for m in raw::decode(data)? {
            match m {
                RawMutation::Put { key, value } => self.put(&key, &value)?,
                RawMutation::Delete { key } => self.delete(&key)?,
                RawMutation::DeleteRange { begin_key, end_key } => {
                    self.delete_range(&begin_key, &end_key)?
                }
            }
        }
        Ok(())
    }

    fn commit(self, sync: bool) -> Result<()> {
        self.engine.clone().apply(self.ops, sync);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MemSnapshot {
    map: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Peekable for MemSnapshot {
    fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }
}

impl Iterable for MemSnapshot {
    fn scan(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        for (k, v) in self.map.range(start_key.to_vec()..end_key.to_vec()) {
            if !f(k, v)? {
                break;
            }
        }
        Ok(())
    }
}

impl Snapshot for MemSnapshot {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_read_through() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        wb.put(b"a", b"1").unwrap();
        wb.put(b"b", b"2").unwrap();
        wb.commit(true).unwrap();

        let mut wb = engine.write_batch();
        assert_eq!(wb.get_value(b"a").unwrap().unwrap(), b"1");
        wb.put(b"a", b"3").unwrap();
        assert_eq!(wb.get_value(b"a").unwrap().unwrap(), b"3");
        wb.delete(b"b").unwrap();
        assert_eq!(wb.get_value(b"b").unwrap(), None);
        // Nothing is visible on the engine until commit.
        assert_eq!(engine.get_value(b"a").unwrap().unwrap(), b"1");
        wb.commit(false).unwrap();
        assert_eq!(engine.get_value(b"a").unwrap().unwrap(), b"3");
        assert_eq!(engine.get_value(b"b").unwrap(), None);
    }

    #[test]
    fn test_delete_range_shadows_batch_writes() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        wb.put(b"k1", b"old").unwrap();
        wb.commit(true).unwrap();

        let mut wb = engine.write_batch();
        wb.put(b"k2", b"new").unwrap();
        wb.delete_range(b"k1", b"k9").unwrap();
        assert_eq!(wb.get_value(b"k1").unwrap(), None);
        assert_eq!(wb.get_value(b"k2").unwrap(), None);
        // A put staged after the range deletion is visible again.
        wb.put(b"k1", b"resurrected").unwrap();
        assert_eq!(wb.get_value(b"k1").unwrap().unwrap(), b"resurrected");
        wb.commit(false).unwrap();
        assert_eq!(engine.get_value(b"k1").unwrap().unwrap(), b"resurrected");
        assert_eq!(engine.get_value(b"k2").unwrap(), None);
    }

    #[test]
    fn test_crash_rolls_back_unsynced() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        wb.put(b"durable", b"1").unwrap();
        wb.commit(true).unwrap();

        let mut wb = engine.write_batch();
        wb.put(b"volatile", b"2").unwrap();
        wb.put(b"durable", b"overwritten").unwrap();
        wb.commit(false).unwrap();

        engine.crash();
        assert_eq!(engine.get_value(b"durable").unwrap().unwrap(), b"1");
        assert_eq!(engine.get_value(b"volatile").unwrap(), None);
    }

    #[test]
    fn test_flush_preserves_unsynced() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        wb.put(b"k", b"v").unwrap();
        wb.commit(false).unwrap();
        engine.flush();
        engine.crash();
        assert_eq!(engine.get_value(b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_snapshot_isolation() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        wb.put(b"k", b"v1").unwrap();
        wb.commit(true).unwrap();

        let snap = engine.snapshot();
        let mut wb = engine.write_batch();
        wb.put(b"k", b"v2").unwrap();
        wb.commit(true).unwrap();

        assert_eq!(snap.get_value(b"k").unwrap().unwrap(), b"v1");
        assert_eq!(engine.get_value(b"k").unwrap().unwrap(), b"v2");
    }

    #[test]
    fn test_ingest_external_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("i1.t1.sst");
        write_external_file(
            &path,
            &[
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ],
        )
        .unwrap();

        let engine = MemEngine::new();
        engine.ingest_external_file(&path).unwrap();
        assert_eq!(engine.get_value(b"a").unwrap().unwrap(), b"1");
        assert_eq!(engine.get_value(b"b").unwrap().unwrap(), b"2");

        // An ingestion before a crash is replayed with its command.
        engine.crash();
        assert_eq!(engine.get_value(b"a").unwrap(), None);
    }

    #[test]
    fn test_scan_order_and_stop() {
        let engine = MemEngine::new();
        let mut wb = engine.write_batch();
        for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
            wb.put(k, v).unwrap();
        }
        wb.commit(true).unwrap();

        let mut seen = vec![];
        engine
            .scan(b"a", b"z", &mut |k, _| {
                seen.push(k.to_vec());
                Ok(seen.len() < 2)
            })
            .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
