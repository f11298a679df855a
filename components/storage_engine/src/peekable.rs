// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use crate::Result;

/// Point reads over an engine, snapshot or batch.
pub trait Peekable {
    fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}
