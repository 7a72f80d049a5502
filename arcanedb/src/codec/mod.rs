//! Byte codecs.
//!
//! `comparable` holds the order-preserving encoding used for sort keys:
//! byte-wise lexicographic order of the encoded form equals the natural order
//! of the typed tuple. The row codec itself lives in [`crate::row`] and builds
//! on the helpers here.

pub mod comparable;

use crate::error::{CResult, Error};

/// Reads a little-endian u16 at `offset`, as written by the row codec.
pub fn decode_u16_le(buf: &[u8], offset: usize) -> CResult<u16> {
    let end = offset + 2;
    if buf.len() < end {
        return Err(Error::EndOfBuf);
    }
    Ok(u16::from_le_bytes([buf[offset], buf[offset + 1]]))
}
