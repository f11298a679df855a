// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::fs;
use std::path::Path;

use slog_global::warn;
use storage_engine::{ImportExt, StorageEngine};

use crate::store::command::AddSstable;
use crate::Result;

/// Ingests a command's SSTable into the engine, outside the application
/// batch, before that batch commits. Returns whether the file had to be
/// copied into sideloaded storage first.
///
/// Re-application after a crash finds the file already sideloaded and only
/// re-ingests it.
pub(crate) fn add_sstable_pre_apply<E: StorageEngine>(
    engine: &E,
    sideloaded: &Path,
    term: u64,
    index: u64,
    sst: &AddSstable,
) -> Result<bool> {
    fs::create_dir_all(sideloaded)?;
    let path = sideloaded.join(format!("i{}.t{}.sst", index, term));
    let copied = !path.exists();
    if copied {
        fs::write(&path, &sst.data)?;
    } else {
        warn!(
            "sideloaded file already exists, reusing";
            "path" => %path.display(),
            "index" => index,
            "term" => term,
        );
    }
    engine.ingest_external_file(&path)?;
    Ok(copied)
}
