// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use crate::{Mutable, Peekable, Result};

/// An ordered, atomically committable group of mutations.
///
/// Mutations are applied in staging order. Reads on the batch observe staged
/// mutations layered over the engine's committed state, so a later command in
/// the same batch sees the writes of earlier ones. `commit(sync)` makes the
/// whole batch visible atomically; only a synced commit is durable across a
/// crash, an unsynced one survives clean shutdown only.
pub trait StorageBatch: Mutable + Peekable + Send {
    fn data_size(&self) -> usize;
    fn count(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn clear(&mut self);

    /// Appends a pre-encoded mutation stream (see [`crate::raw`]) to the
    /// batch, preserving its internal order.
    fn apply_raw(&mut self, data: &[u8]) -> Result<()>;

    fn commit(self, sync: bool) -> Result<()>;
}
