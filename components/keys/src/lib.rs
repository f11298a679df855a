// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Key layout of a replica's slice of the engine keyspace.
//!
//! Each replica owns three disjoint regions, all of which sort before or
//! after each other as documented:
//!
//! ```text
//! 0x01 0x01 <range_id: u64 BE> <suffix> ...   range-ID-local keys
//! 0x01 0x02 <user key>                        range-local keys (txn records, ...)
//! 0x02 <user key>                             user data keys
//! ```
//!
//! Range-ID-local keys hold per-replica bookkeeping that never moves with the
//! data: the raft hard state, the applied state, the truncated state, the
//! removal tombstone and the raft log. Range-local keys are addressed by user
//! key and move with splits and merges. The `0x01` local prefix sorts before
//! all user data, so replica-local state can never collide with a user key.

use std::mem;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

pub const LOCAL_PREFIX: u8 = 0x01;
pub const DATA_PREFIX: u8 = 0x02;

const RANGE_ID_INFIX: u8 = 0x01;
const RANGE_LOCAL_INFIX: u8 = 0x02;

const APPLIED_STATE_SUFFIX: u8 = 0x01;
const TRUNCATED_STATE_SUFFIX: u8 = 0x02;
const HARD_STATE_SUFFIX: u8 = 0x03;
const TOMBSTONE_SUFFIX: u8 = 0x04;
const RAFT_LOG_SUFFIX: u8 = 0x05;

const RANGE_ID_PREFIX_LEN: usize = 2 + mem::size_of::<u64>();
const RAFT_LOG_KEY_LEN: usize = RANGE_ID_PREFIX_LEN + 1 + mem::size_of::<u64>();

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("{0} is not a valid raft log key")]
    MalformedRaftLogKey(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn range_id_key(range_id: u64, suffix: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(RANGE_ID_PREFIX_LEN + 1);
    key.push(LOCAL_PREFIX);
    key.push(RANGE_ID_INFIX);
    key.extend_from_slice(&range_id.to_be_bytes());
    key.push(suffix);
    key
}

/// The half-open span of every range-ID-local key of `range_id`.
pub fn range_id_local_span(range_id: u64) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(RANGE_ID_PREFIX_LEN);
    start.push(LOCAL_PREFIX);
    start.push(RANGE_ID_INFIX);
    start.extend_from_slice(&range_id.to_be_bytes());
    let mut end = Vec::with_capacity(RANGE_ID_PREFIX_LEN);
    end.push(LOCAL_PREFIX);
    match range_id.checked_add(1) {
        Some(next) => {
            end.push(RANGE_ID_INFIX);
            end.extend_from_slice(&next.to_be_bytes());
        }
        None => end.push(RANGE_ID_INFIX + 1),
    }
    (start, end)
}

/// Key of the applied state record: applied indices, stats and the closed
/// timestamp, all in one value.
pub fn applied_state_key(range_id: u64) -> Vec<u8> {
    range_id_key(range_id, APPLIED_STATE_SUFFIX)
}

pub fn truncated_state_key(range_id: u64) -> Vec<u8> {
    range_id_key(range_id, TRUNCATED_STATE_SUFFIX)
}

pub fn hard_state_key(range_id: u64) -> Vec<u8> {
    range_id_key(range_id, HARD_STATE_SUFFIX)
}

/// Key of the tombstone left behind when a replica is removed. Its value
/// records the smallest replica ID that may be recreated here.
pub fn tombstone_key(range_id: u64) -> Vec<u8> {
    range_id_key(range_id, TOMBSTONE_SUFFIX)
}

pub fn raft_log_key(range_id: u64, index: u64) -> Vec<u8> {
    let mut key = range_id_key(range_id, RAFT_LOG_SUFFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// The half-open span of every raft log key of `range_id`.
pub fn raft_log_span(range_id: u64) -> (Vec<u8>, Vec<u8>) {
    (
        range_id_key(range_id, RAFT_LOG_SUFFIX),
        range_id_key(range_id, RAFT_LOG_SUFFIX + 1),
    )
}

pub fn raft_log_index(key: &[u8]) -> Result<u64> {
    if key.len() != RAFT_LOG_KEY_LEN || key.get(RANGE_ID_PREFIX_LEN) != Some(&RAFT_LOG_SUFFIX) {
        return Err(Error::MalformedRaftLogKey(format!("{:02x?}", key)));
    }
    Ok(BigEndian::read_u64(&key[RANGE_ID_PREFIX_LEN + 1..]))
}

/// Maps a user key into the range-local region.
pub fn range_local_key(user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + user_key.len());
    key.push(LOCAL_PREFIX);
    key.push(RANGE_LOCAL_INFIX);
    key.extend_from_slice(user_key);
    key
}

/// The range-local span addressed by the user span `[start_key, end_key)`.
pub fn range_local_span(start_key: &[u8], end_key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (range_local_key(start_key), range_local_key(end_key))
}

/// Maps a user key into the data region.
pub fn data_key(user_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + user_key.len());
    key.push(DATA_PREFIX);
    key.extend_from_slice(user_key);
    key
}

/// The data span addressed by the user span `[start_key, end_key)`.
pub fn data_span(start_key: &[u8], end_key: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (data_key(start_key), data_key(end_key))
}

/// Strips the data prefix, inverse of [`data_key`].
pub fn origin_key(data_key: &[u8]) -> &[u8] {
    assert!(
        !data_key.is_empty() && data_key[0] == DATA_PREFIX,
        "{:02x?} is not a data key",
        data_key
    );
    &data_key[1..]
}
