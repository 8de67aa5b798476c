//! Encoding of the persistent queue's index keys.
//!
//! `ri` and `wi` hold one little-endian u64. `di` holds a little-endian u32
//! count followed by that many little-endian u64 indices. A missing or empty
//! `di` value decodes to an empty set.

use super::QueueError;
use bytes::{Buf, BufMut};

/// Key of the read index.
pub const READ_INDEX_KEY: &str = "ri";
/// Key of the write index.
pub const WRITE_INDEX_KEY: &str = "wi";
/// Key of the dispatched index set.
pub const DISPATCHED_KEY: &str = "di";

/// Returns the key the item at `index` is stored under.
pub fn item_key(index: u64) -> String {
    index.to_string()
}

/// Encodes one index.
pub fn encode_index(index: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.put_u64_le(index);
    buf
}

/// Decodes one index.
///
/// # Errors
///
/// Returns [`QueueError::InvalidIndex`] unless `bytes` is exactly 8 bytes.
pub fn decode_index(mut bytes: &[u8]) -> Result<u64, QueueError> {
    if bytes.len() != 8 {
        return Err(QueueError::InvalidIndex("index must be 8 bytes"));
    }
    Ok(bytes.get_u64_le())
}

/// Encodes a set of indices.
pub fn encode_indices(indices: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + indices.len() * 8);
    buf.put_u32_le(indices.len() as u32);
    for index in indices {
        buf.put_u64_le(*index);
    }
    buf
}

/// Decodes a set of indices.
///
/// # Errors
///
/// Returns [`QueueError::InvalidIndex`] when the length prefix does not match
/// the payload.
pub fn decode_indices(mut bytes: &[u8]) -> Result<Vec<u64>, QueueError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    if bytes.len() < 4 {
        return Err(QueueError::InvalidIndex("index set is missing its length"));
    }
    let count = bytes.get_u32_le() as usize;
    if bytes.len() != count * 8 {
        return Err(QueueError::InvalidIndex(
            "index set length does not match its payload",
        ));
    }
    let mut indices = Vec::with_capacity(count);
    for _ in 0..count {
        indices.push(bytes.get_u64_le());
    }
    Ok(indices)
}
