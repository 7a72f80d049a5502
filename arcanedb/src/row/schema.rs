use std::collections::HashMap;

use crate::error::{CResult, Error};
use crate::row::{ColumnId, SchemaId, ValueType};

/// A single column definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub id: ColumnId,
    pub name: String,
    pub value_type: ValueType,
}

impl Column {
    pub fn new(id: ColumnId, name: impl Into<String>, value_type: ValueType) -> Column {
        Column { id, name: name.into(), value_type }
    }
}

/// Column metadata for a table, immutable once constructed.
///
/// The first `sort_key_count` columns form the row's sort key and are encoded
/// with the comparable codec; the remaining columns live in the fixed-width
/// column area (strings occupy a 4-byte offset/length slot there). The offset
/// of every non-sort column within the column area is cached at construction.
#[derive(Debug)]
pub struct Schema {
    schema_id: SchemaId,
    columns: Vec<Column>,
    sort_key_count: usize,
    column_index: HashMap<ColumnId, usize>,
    // offset of columns[i] within the column area, for i >= sort_key_count;
    // the final slot holds the total fixed-area size.
    row_offsets: Vec<usize>,
}

impl Schema {
    pub fn new(schema_id: SchemaId, columns: Vec<Column>, sort_key_count: usize) -> CResult<Schema> {
        if sort_key_count == 0 || sort_key_count > columns.len() {
            return Err(Error::Internal(format!(
                "sort key count {} out of range for {} columns",
                sort_key_count,
                columns.len()
            )));
        }
        let mut column_index = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            if column_index.insert(column.id, i).is_some() {
                return Err(Error::Internal(format!("duplicate column id {}", column.id)));
            }
        }
        let mut row_offsets = vec![0; columns.len() + 1];
        let mut offset = 0;
        for i in sort_key_count..columns.len() {
            row_offsets[i] = offset;
            offset += match columns[i].value_type {
                ValueType::Int32 | ValueType::Float | ValueType::String => 4,
                ValueType::Int64 | ValueType::Double => 8,
                ValueType::Bool => 1,
            };
        }
        row_offsets[columns.len()] = offset;
        Ok(Schema { schema_id, columns, sort_key_count, column_index, row_offsets })
    }

    pub fn schema_id(&self) -> SchemaId {
        self.schema_id
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn sort_key_count(&self) -> usize {
        self.sort_key_count
    }

    pub fn column_by_index(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn column_index(&self, id: ColumnId) -> CResult<usize> {
        self.column_index
            .get(&id)
            .copied()
            .ok_or_else(|| Error::Internal(format!("unknown column id {}", id)))
    }

    /// Byte offset of column `index` within the fixed-width column area.
    /// `index == column_count()` yields the total fixed-area size.
    pub fn column_offset(&self, index: usize) -> usize {
        self.row_offsets[index]
    }
}
