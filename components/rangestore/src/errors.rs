// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::{error, io, result};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("range {0} not found")]
    RangeNotFound(u64),
    /// A check failed that must hold identically on every replica. The caller
    /// must treat this as fatal: continuing would silently diverge from the
    /// rest of the replication group.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
    #[error("Engine {0}")]
    Engine(#[from] storage_engine::Error),
    #[error("Keys {0}")]
    Keys(#[from] keys::Error),
    #[error("Codec {0}")]
    Codec(#[from] postcard::Error),
    #[error("Io {0}")]
    Io(#[from] io::Error),
    #[error("{0:?}")]
    Other(#[from] Box<dyn error::Error + Sync + Send>),
}

pub type Result<T> = result::Result<T, Error>;

/// Boxes a one-off error message into [`Error::Other`].
#[macro_export]
macro_rules! box_err {
    ($e:expr) => ({
        let e: Box<dyn std::error::Error + Sync + Send> =
            format!("[{}:{}]: {}", file!(), line!(), $e).into();
        e.into()
    });
    ($f:tt, $($arg:expr),+) => ({
        box_err!(format!($f, $($arg),+))
    });
}
