// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

use crate::Result;

const MIB: i64 = 1024 * 1024;

/// Store-level configuration consumed below raft.
///
/// Checking settings below raft is usually a state machine divergence hazard.
/// The only consumer here is raft log truncation, which is not part of the
/// replicated state machine: each replica only has to truncate its own log
/// correctly, divergence in *when* is harmless.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Defer raft log truncation to the background truncator instead of
    /// performing it inside the application batch. Commands that do not carry
    /// an expected first index fall back to the strongly coupled path
    /// regardless of this setting.
    pub loosely_coupled_raft_log_truncation: bool,
    /// A replica larger than this signals the split queue after commit.
    pub range_max_bytes: i64,
    /// A replica smaller than this signals the merge queue after commit.
    pub range_min_bytes: i64,
    /// A raft log larger than this signals the truncation queue after commit.
    pub raft_log_size_soft_limit: i64,
    /// Minimum delay between two split or merge queue signals from the same
    /// replica, in milliseconds.
    pub queue_throttle_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            loosely_coupled_raft_log_truncation: false,
            range_max_bytes: 512 * MIB,
            range_min_bytes: 128 * MIB,
            raft_log_size_soft_limit: 4 * MIB,
            queue_throttle_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.range_max_bytes <= 0 {
            return Err(box_err!("range-max-bytes must be positive"));
        }
        if self.range_min_bytes < 0 || self.range_min_bytes >= self.range_max_bytes {
            return Err(box_err!(
                "range-min-bytes {} must be in [0, range-max-bytes {})",
                self.range_min_bytes,
                self.range_max_bytes
            ));
        }
        if self.raft_log_size_soft_limit <= 0 {
            return Err(box_err!("raft-log-size-soft-limit must be positive"));
        }
        Ok(())
    }
}
