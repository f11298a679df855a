// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::{error, io, result};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Engine uses a plain string as the error.
    #[error("storage engine {0}")]
    Engine(String),
    #[error("corrupted write batch: {0}")]
    CorruptedWriteBatch(String),
    #[error("Io {0}")]
    Io(#[from] io::Error),
    #[error("{0:?}")]
    Other(#[from] Box<dyn error::Error + Sync + Send>),
}

pub type Result<T> = result::Result<T, Error>;
