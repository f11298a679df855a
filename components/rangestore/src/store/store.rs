// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use storage_engine::StorageEngine;

use crate::store::config::Config;
use crate::store::replica::Replica;
use crate::store::state::RangeId;
use crate::store::state::StoreId;
use crate::store::truncate::RaftLogTruncator;
use crate::{Error, Result};

/// A prod from the applicator to background queue infrastructure. The
/// applicator only ever pushes; the owning queue drains at its own pace.
pub struct QueueSignal {
    tx: Sender<RangeId>,
    rx: Receiver<RangeId>,
}

impl QueueSignal {
    fn new() -> QueueSignal {
        let (tx, rx) = unbounded();
        QueueSignal { tx, rx }
    }

    pub(crate) fn push(&self, range_id: RangeId) {
        let _ = self.tx.send(range_id);
    }

    pub fn pop(&self) -> Option<RangeId> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// The singleton owner of every replica in this process.
pub struct Store<E: StorageEngine> {
    store_id: StoreId,
    engine: E,
    cfg: Config,
    replicas: RwLock<HashMap<RangeId, Arc<Replica>>>,
    truncator: RaftLogTruncator<E>,

    /// Replicas that grew past the size threshold.
    pub split_queue: QueueSignal,
    /// Replicas that shrank below the size threshold.
    pub merge_queue: QueueSignal,
    /// Replicas whose raft log wants truncation.
    pub raft_log_queue: QueueSignal,
    /// Replicas destroyed by an applied batch, awaiting final cleanup.
    pub destroyed_queue: QueueSignal,
}

impl<E: StorageEngine> Store<E> {
    pub fn new(store_id: StoreId, engine: E, cfg: Config) -> Result<Store<E>> {
        cfg.validate()?;
        Ok(Store {
            store_id,
            engine: engine.clone(),
            cfg,
            replicas: RwLock::new(HashMap::new()),
            truncator: RaftLogTruncator::new(engine),
            split_queue: QueueSignal::new(),
            merge_queue: QueueSignal::new(),
            raft_log_queue: QueueSignal::new(),
            destroyed_queue: QueueSignal::new(),
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn truncator(&self) -> &RaftLogTruncator<E> {
        &self.truncator
    }

    pub fn insert_replica(&self, replica: Arc<Replica>) {
        self.replicas.write().insert(replica.range_id(), replica);
    }

    pub fn get_replica(&self, range_id: RangeId) -> Result<Arc<Replica>> {
        self.replicas
            .read()
            .get(&range_id)
            .cloned()
            .ok_or(Error::RangeNotFound(range_id))
    }

    /// Drops a destroyed replica from the map. The replica's data is already
    /// gone; this only severs the in-memory registration.
    pub fn remove_replica(&self, range_id: RangeId) -> Option<Arc<Replica>> {
        self.replicas.write().remove(&range_id)
    }
}
