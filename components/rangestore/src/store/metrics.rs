// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, register_histogram, register_int_counter, register_int_counter_vec,
    Histogram, IntCounter, IntCounterVec,
};

lazy_static! {
    pub static ref APPLY_COMMAND_COMMIT_DURATION: Histogram = register_histogram!(
        "rangestore_apply_command_commit_duration_seconds",
        "Bucketed histogram of the time spent committing an application batch",
        exponential_buckets(0.00001, 2.0, 26).unwrap()
    )
    .unwrap();
    pub static ref APPLY_FORCED_ERROR_COUNTER: IntCounterVec = register_int_counter_vec!(
        "rangestore_apply_forced_error_total",
        "Total number of commands rejected below raft, by kind",
        &["kind"]
    )
    .unwrap();
    pub static ref APPLY_ENTRIES: IntCounter = register_int_counter!(
        "rangestore_apply_entries_total",
        "Total number of committed entries applied"
    )
    .unwrap();
    pub static ref APPLY_EMPTY_ENTRIES: IntCounter = register_int_counter!(
        "rangestore_apply_empty_entries_total",
        "Total number of empty committed entries applied"
    )
    .unwrap();
    pub static ref APPLY_BATCHES: IntCounter = register_int_counter!(
        "rangestore_apply_batches_total",
        "Total number of application batches committed"
    )
    .unwrap();
    pub static ref ADD_SSTABLE_APPLICATIONS: IntCounter = register_int_counter!(
        "rangestore_addsstable_applications_total",
        "Total number of SSTable ingestions applied below raft"
    )
    .unwrap();
    pub static ref ADD_SSTABLE_COPIES: IntCounter = register_int_counter!(
        "rangestore_addsstable_copies_total",
        "Total number of SSTable ingestions that copied the file into \
         sideloaded storage"
    )
    .unwrap();
    pub static ref FOLLOWER_STORE_WRITE_BYTES: IntCounterVec = register_int_counter_vec!(
        "rangestore_follower_store_write_bytes_total",
        "Bytes applied on this store for commands proposed elsewhere, by kind",
        &["kind"]
    )
    .unwrap();
}
