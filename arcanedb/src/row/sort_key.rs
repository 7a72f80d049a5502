use std::fmt::{Debug, Formatter};

use crate::codec::comparable::{put_comparable_value, ComparableReader};
use crate::error::CResult;
use crate::row::{OwnedValue, Value};

/// An owned, order-preserving encoded sort key.
///
/// Byte-wise comparison of the encoded form equals the natural ordering of the
/// underlying typed tuple, and equal tuples produce equal bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    bytes: Vec<u8>,
}

impl SortKey {
    /// Encodes a tuple of values into a sort key.
    pub fn new(values: &[Value]) -> SortKey {
        let mut bytes = Vec::new();
        for value in values {
            put_comparable_value(&mut bytes, value);
        }
        SortKey { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> SortKey {
        SortKey { bytes: bytes.to_vec() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_ref(&self) -> SortKeyRef<'_> {
        SortKeyRef { bytes: &self.bytes }
    }

    /// Decodes the tuple back out, mostly for diagnostics and tests.
    pub fn decode(&self) -> CResult<Vec<OwnedValue>> {
        self.as_ref().decode()
    }
}

impl Debug for SortKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.decode() {
            Ok(values) => write!(f, "SortKey{:?}", values),
            Err(_) => write!(f, "SortKey(raw {:02x?})", self.as_slice()),
        }
    }
}

/// A borrowed view over an encoded sort key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKeyRef<'a> {
    bytes: &'a [u8],
}

impl<'a> SortKeyRef<'a> {
    pub fn new(bytes: &'a [u8]) -> SortKeyRef<'a> {
        SortKeyRef { bytes }
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn to_owned(&self) -> SortKey {
        SortKey { bytes: self.bytes.to_vec() }
    }

    pub fn decode(&self) -> CResult<Vec<OwnedValue>> {
        let mut reader = ComparableReader::new(self.bytes);
        let mut values = Vec::new();
        while reader.remaining() > 0 {
            values.push(reader.read_value()?);
        }
        Ok(values)
    }
}

impl<'a> Debug for SortKeyRef<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.decode() {
            Ok(values) => write!(f, "SortKey{:?}", values),
            Err(_) => write!(f, "SortKey(raw {:02x?})", self.as_slice()),
        }
    }
}
