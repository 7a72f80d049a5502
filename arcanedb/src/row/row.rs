use bytes::BufMut;

use crate::codec::comparable::ComparableReader;
use crate::codec::decode_u16_le;
use crate::error::{CResult, Error};
use crate::row::{ColumnId, OwnedValue, Schema, SortKey, SortKeyRef, Value, ValueType};

pub const ROW_TOTAL_LEN_SIZE: usize = 2;
pub const ROW_SORT_KEY_LEN_OFFSET: usize = 2;
pub const ROW_SORT_KEY_OFFSET: usize = 4;

/// A borrowed view over a serialized row.
///
/// Row format:
/// `| total length u16 | sort key length u16 | sort key varlen | columns... |`
///
/// The sort-key prefix is the comparable encoding of the first
/// `schema.sort_key_count()` column values. Fixed-width columns follow inline
/// in little-endian layout; string columns occupy a `(offset u16, length u16)`
/// slot pointing into the payload region at the tail of the row. `total
/// length` covers the entire row including the header.
#[derive(Clone, Copy, Debug)]
pub struct Row<'a> {
    buf: &'a [u8],
}

impl<'a> Row<'a> {
    /// Wraps a buffer whose first bytes are a serialized row. The buffer may
    /// extend past the row; `as_slice` trims it to the encoded total length.
    pub fn new(buf: &'a [u8]) -> Row<'a> {
        Row { buf }
    }

    pub fn as_slice(&self) -> &'a [u8] {
        let total = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        &self.buf[..total]
    }

    pub fn sort_key(&self) -> SortKeyRef<'a> {
        let len = u16::from_le_bytes([
            self.buf[ROW_SORT_KEY_LEN_OFFSET],
            self.buf[ROW_SORT_KEY_LEN_OFFSET + 1],
        ]) as usize;
        SortKeyRef::new(&self.buf[ROW_SORT_KEY_OFFSET..ROW_SORT_KEY_OFFSET + len])
    }

    /// Reads the value of the column identified by `id`.
    ///
    /// Sort-key columns are decoded from the comparable prefix; the rest are
    /// read from the fixed-width area, following the string indirection where
    /// needed.
    pub fn get_prop(&self, id: ColumnId, schema: &Schema) -> CResult<OwnedValue> {
        let index = schema.column_index(id)?;
        if index < schema.sort_key_count() {
            return self.get_sort_key_prop(index);
        }
        self.get_column_area_prop(index, schema)
    }

    fn get_sort_key_prop(&self, index: usize) -> CResult<OwnedValue> {
        let mut reader = ComparableReader::new(self.sort_key().as_slice());
        reader.skip_fields(index)?;
        reader.read_value()
    }

    fn get_column_area_prop(&self, index: usize, schema: &Schema) -> CResult<OwnedValue> {
        let sort_key_len = decode_u16_le(self.buf, ROW_SORT_KEY_LEN_OFFSET)? as usize;
        let offset = ROW_SORT_KEY_OFFSET + sort_key_len + schema.column_offset(index);
        let value = match schema.column_by_index(index).value_type {
            ValueType::Int32 => {
                let b = self.fixed(offset, 4)?;
                OwnedValue::Int32(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            ValueType::Int64 => {
                let b = self.fixed(offset, 8)?;
                OwnedValue::Int64(i64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            ValueType::Float => {
                let b = self.fixed(offset, 4)?;
                OwnedValue::Float(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            }
            ValueType::Double => {
                let b = self.fixed(offset, 8)?;
                OwnedValue::Double(f64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            ValueType::Bool => OwnedValue::Bool(self.fixed(offset, 1)?[0] != 0),
            ValueType::String => {
                let string_offset = decode_u16_le(self.buf, offset)? as usize;
                let string_len = decode_u16_le(self.buf, offset + 2)? as usize;
                let bytes = self.fixed(string_offset, string_len)?;
                OwnedValue::String(std::str::from_utf8(bytes)?.to_owned())
            }
        };
        Ok(value)
    }

    fn fixed(&self, offset: usize, len: usize) -> CResult<&'a [u8]> {
        if self.buf.len() < offset + len {
            return Err(Error::EndOfBuf);
        }
        Ok(&self.buf[offset..offset + len])
    }

    /// Serializes `values` under `schema` into a self-contained row buffer.
    /// `values` must match the schema's columns one to one.
    pub fn serialize(values: &[Value], schema: &Schema) -> CResult<Vec<u8>> {
        if values.len() != schema.column_count() {
            return Err(Error::Internal(format!(
                "expected {} values, got {}",
                schema.column_count(),
                values.len()
            )));
        }
        for (i, value) in values.iter().enumerate() {
            let expected = schema.column_by_index(i).value_type;
            if value.value_type() != expected {
                return Err(Error::Internal(format!(
                    "column {} expects {:?}, got {:?}",
                    i,
                    expected,
                    value.value_type()
                )));
            }
        }

        let sort_key = SortKey::new(&values[..schema.sort_key_count()]);
        let sk = sort_key.as_slice();

        let mut buf = Vec::new();
        buf.put_u16_le(0); // total length, patched below
        buf.put_u16_le(sk.len() as u16);
        buf.put_slice(sk);

        let mut string_offset =
            ROW_SORT_KEY_OFFSET + sk.len() + schema.column_offset(schema.column_count());
        let mut payloads: Vec<&str> = Vec::new();
        for value in values.iter().skip(schema.sort_key_count()) {
            match value {
                Value::Int32(v) => buf.put_i32_le(*v),
                Value::Int64(v) => buf.put_i64_le(*v),
                Value::Float(v) => buf.put_f32_le(*v),
                Value::Double(v) => buf.put_f64_le(*v),
                Value::Bool(v) => buf.put_u8(*v as u8),
                Value::String(v) => {
                    buf.put_u16_le(string_offset as u16);
                    buf.put_u16_le(v.len() as u16);
                    string_offset += v.len();
                    payloads.push(v);
                }
            }
        }
        for payload in payloads {
            buf.put_slice(payload.as_bytes());
        }

        if buf.len() > u16::MAX as usize {
            return Err(Error::Internal(format!("row of {} bytes overflows header", buf.len())));
        }
        let total = (buf.len() as u16).to_le_bytes();
        buf[0] = total[0];
        buf[1] = total[1];
        Ok(buf)
    }

    /// Serializes a row that carries only the sort-key portion. Tombstones are
    /// stored this way: the key must remain comparable but has no columns.
    pub fn serialize_only_sort_key(sort_key: SortKeyRef) -> Vec<u8> {
        let sk = sort_key.as_slice();
        let total = (ROW_SORT_KEY_OFFSET + sk.len()) as u16;
        let mut buf = Vec::with_capacity(total as usize);
        buf.put_u16_le(total);
        buf.put_u16_le(sk.len() as u16);
        buf.put_slice(sk);
        buf
    }
}
