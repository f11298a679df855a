// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! A thin trait layer over the ordered key-value engine that backs replica
//! state machines.
//!
//! The application core never talks to a concrete engine. It requires an
//! engine that offers ordered, atomically committable batches which read
//! through to the committed state, plus snapshot reads and external file
//! ingestion. Writes staged in a batch are visible to subsequent reads on the
//! same batch; a committed batch is durable iff it was synced.

mod errors;
mod mutable;
mod peekable;
pub mod raw;
mod write_batch;

pub use crate::errors::{Error, Result};
pub use crate::mutable::Mutable;
pub use crate::peekable::Peekable;
pub use crate::write_batch::StorageBatch;

use std::fmt::Debug;
use std::path::Path;

/// A consistent point-in-time read view of the engine.
pub trait Snapshot: Peekable + Iterable + Send + Sync + Debug + 'static {}

/// Ordered scans over a half-open key range.
///
/// The callback returns `false` to stop the scan early.
pub trait Iterable {
    fn scan(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()>;
}

/// Ingestion of externally built sorted files, outside of any batch.
///
/// Ingested data is as durable as a synced commit; engines move or copy the
/// file into their own storage before returning.
pub trait ImportExt {
    fn ingest_external_file(&self, path: &Path) -> Result<()>;
}

/// The engine that a store hands to the replica application core.
pub trait StorageEngine:
    Peekable + Iterable + ImportExt + Clone + Send + Sync + Debug + 'static
{
    type Batch: StorageBatch;
    type Snapshot: Snapshot;

    fn write_batch(&self) -> Self::Batch;
    fn snapshot(&self) -> Self::Snapshot;
}
