// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Codec for the opaque mutation stream carried by replicated commands.
//!
//! Layout: a big-endian `u32` mutation count, then one record per mutation.
//! Each record is a one-byte tag followed by length-prefixed operands. The
//! count header exists so appliers can account mutations without decoding the
//! whole stream.

use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::{Error, Result};

const TAG_PUT: u8 = 0;
const TAG_DELETE: u8 = 1;
const TAG_DELETE_RANGE: u8 = 2;

const COUNT_HEADER_LEN: usize = 4;

#[derive(Clone, Debug, PartialEq)]
pub enum RawMutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    DeleteRange { begin_key: Vec<u8>, end_key: Vec<u8> },
}

/// Reads the mutation count header without decoding the records.
pub fn decode_count(data: &[u8]) -> Result<usize> {
    if data.len() < COUNT_HEADER_LEN {
        return Err(Error::CorruptedWriteBatch(format!(
            "stream of {} bytes is shorter than the count header",
            data.len()
        )));
    }
    Ok(BigEndian::read_u32(data) as usize)
}

pub fn encode(mutations: &[RawMutation]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(COUNT_HEADER_LEN + mutations.len() * 16);
    buf.extend_from_slice(&(mutations.len() as u32).to_be_bytes());
    for m in mutations {
        match m {
            RawMutation::Put { key, value } => {
                buf.push(TAG_PUT);
                encode_slice(&mut buf, key);
                encode_slice(&mut buf, value);
            }
            RawMutation::Delete { key } => {
                buf.push(TAG_DELETE);
                encode_slice(&mut buf, key);
            }
            RawMutation::DeleteRange { begin_key, end_key } => {
                buf.push(TAG_DELETE_RANGE);
                encode_slice(&mut buf, begin_key);
                encode_slice(&mut buf, end_key);
            }
        }
    }
    buf
}

pub fn decode(data: &[u8]) -> Result<Vec<RawMutation>> {
    let count = decode_count(data)?;
    let mut cursor = Cursor::new(&data[COUNT_HEADER_LEN..]);
    let mut mutations = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = cursor
            .read_u8()
            .map_err(|_| truncated(data.len(), count, mutations.len()))?;
        let m = match tag {
            TAG_PUT => RawMutation::Put {
                key: decode_slice(&mut cursor)?,
                value: decode_slice(&mut cursor)?,
            },
            TAG_DELETE => RawMutation::Delete {
                key: decode_slice(&mut cursor)?,
            },
            TAG_DELETE_RANGE => RawMutation::DeleteRange {
                begin_key: decode_slice(&mut cursor)?,
                end_key: decode_slice(&mut cursor)?,
            },
            tag => {
                return Err(Error::CorruptedWriteBatch(format!(
                    "unknown mutation tag {}",
                    tag
                )));
            }
        };
        mutations.push(m);
    }
    if cursor.position() as usize != data.len() - COUNT_HEADER_LEN {
        return Err(Error::CorruptedWriteBatch(format!(
            "{} trailing bytes after {} mutations",
            data.len() - COUNT_HEADER_LEN - cursor.position() as usize,
            count
        )));
    }
    Ok(mutations)
}

fn encode_slice(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s);
}

fn decode_slice(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::CorruptedWriteBatch(e.to_string()))? as usize;
    let pos = cursor.position() as usize;
    let data = *cursor.get_ref();
    if pos + len > data.len() {
        return Err(Error::CorruptedWriteBatch(format!(
            "operand of {} bytes overruns stream",
            len
        )));
    }
    cursor.set_position((pos + len) as u64);
    Ok(data[pos..pos + len].to_vec())
}

fn truncated(len: usize, expected: usize, got: usize) -> Error {
    Error::CorruptedWriteBatch(format!(
        "stream of {} bytes ends after {} of {} mutations",
        len, got, expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mutations = vec![
            RawMutation::Put {
                key: b"k1".to_vec(),
                value: b"v1".to_vec(),
            },
            RawMutation::Delete { key: b"k2".to_vec() },
            RawMutation::DeleteRange {
                begin_key: b"a".to_vec(),
                end_key: b"z".to_vec(),
            },
        ];
        let data = encode(&mutations);
        assert_eq!(decode_count(&data).unwrap(), 3);
        assert_eq!(decode(&data).unwrap(), mutations);
    }

    #[test]
    fn test_empty_stream() {
        let data = encode(&[]);
        assert_eq!(decode_count(&data).unwrap(), 0);
        assert!(decode(&data).unwrap().is_empty());
    }

    #[test]
    fn test_corrupted() {
        assert!(decode_count(b"\x00\x01").is_err());
        let mut data = encode(&[RawMutation::Delete { key: b"k".to_vec() }]);
        data.truncate(6);
        assert!(decode(&data).is_err());
        // Wrong tag.
        let mut data = encode(&[RawMutation::Delete { key: b"k".to_vec() }]);
        data[4] = 9;
        assert!(decode(&data).is_err());
    }
}
