// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use crate::Result;

/// Point and range mutations.
///
/// `delete_range` removes every key in the half-open range `[begin, end)`.
pub trait Mutable {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
    fn delete_range(&mut self, begin_key: &[u8], end_key: &[u8]) -> Result<()>;
}
