//! Rows, schemas and sort keys.
//!
//! A row is a self-describing byte sequence: a small header, an
//! order-preserving encoded sort-key prefix, then the remaining columns packed
//! in schema order. Sort keys compare correctly with plain `memcmp` on their
//! encoded bytes, which is what lets pages binary-search rows without knowing
//! the schema.

mod row;
mod schema;
mod sort_key;

pub use row::{Row, ROW_SORT_KEY_OFFSET};
pub use schema::{Column, Schema};
pub use sort_key::{SortKey, SortKeyRef};

use crate::error::{CResult, Error};

pub type SchemaId = u32;
pub type ColumnId = u32;

/// Column value types supported by the row codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Int32 = 0,
    Int64 = 1,
    Float = 2,
    Double = 3,
    String = 4,
    Bool = 5,
}

impl ValueType {
    pub fn from_u8(tag: u8) -> CResult<ValueType> {
        match tag {
            0 => Ok(ValueType::Int32),
            1 => Ok(ValueType::Int64),
            2 => Ok(ValueType::Float),
            3 => Ok(ValueType::Double),
            4 => Ok(ValueType::String),
            5 => Ok(ValueType::Bool),
            t => Err(Error::Corrupted(format!("unknown value type tag {}", t))),
        }
    }
}

/// A borrowed column value, used when serializing rows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value<'a> {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(&'a str),
    Bool(bool),
}

impl<'a> Value<'a> {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Bool(_) => ValueType::Bool,
        }
    }
}

/// An owned column value, produced when decoding rows.
#[derive(Clone, Debug, PartialEq)]
pub enum OwnedValue {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bool(bool),
}

impl OwnedValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            OwnedValue::Int32(_) => ValueType::Int32,
            OwnedValue::Int64(_) => ValueType::Int64,
            OwnedValue::Float(_) => ValueType::Float,
            OwnedValue::Double(_) => ValueType::Double,
            OwnedValue::String(_) => ValueType::String,
            OwnedValue::Bool(_) => ValueType::Bool,
        }
    }

    pub fn as_value(&self) -> Value<'_> {
        match self {
            OwnedValue::Int32(v) => Value::Int32(*v),
            OwnedValue::Int64(v) => Value::Int64(*v),
            OwnedValue::Float(v) => Value::Float(*v),
            OwnedValue::Double(v) => Value::Double(*v),
            OwnedValue::String(v) => Value::String(v),
            OwnedValue::Bool(v) => Value::Bool(*v),
        }
    }
}

impl<'a> From<Value<'a>> for OwnedValue {
    fn from(value: Value<'a>) -> Self {
        match value {
            Value::Int32(v) => OwnedValue::Int32(v),
            Value::Int64(v) => OwnedValue::Int64(v),
            Value::Float(v) => OwnedValue::Float(v),
            Value::Double(v) => OwnedValue::Double(v),
            Value::String(v) => OwnedValue::String(v.to_owned()),
            Value::Bool(v) => OwnedValue::Bool(v),
        }
    }
}
