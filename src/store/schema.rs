use std::sync::Arc;

use arrow::array::new_null_array;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Semantic column types supported by the store. Each maps to exactly one
/// Arrow physical type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Float,
    Str,
    Bool,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn to_arrow(self) -> DataType {
        match self {
            ColumnType::Int => DataType::Int64,
            ColumnType::Float => DataType::Float64,
            ColumnType::Str => DataType::Utf8,
            ColumnType::Bool => DataType::Boolean,
            ColumnType::Date => DataType::Date32,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Nanosecond, None),
        }
    }

    pub fn from_arrow(dtype: &DataType) -> Option<ColumnType> {
        match dtype {
            DataType::Int64 => Some(ColumnType::Int),
            DataType::Float64 => Some(ColumnType::Float),
            DataType::Utf8 => Some(ColumnType::Str),
            DataType::Boolean => Some(ColumnType::Bool),
            DataType::Date32 => Some(ColumnType::Date),
            DataType::Timestamp(TimeUnit::Nanosecond, None) => Some(ColumnType::Timestamp),
            _ => None,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Str => "str",
            ColumnType::Bool => "bool",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub dtype: ColumnType,
    pub nullable: bool,
}

/// Logical schema of a stored table. Once a table exists on disk its schema
/// may only be widened: new nullable columns may be appended, existing
/// columns keep their name and type forever.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn from_arrow(table: &str, schema: &Schema) -> Result<TableSchema, StoreError> {
        let mut columns = Vec::with_capacity(schema.fields().len());
        for field in schema.fields() {
            let dtype = ColumnType::from_arrow(field.data_type()).ok_or_else(|| {
                StoreError::SchemaConflict {
                    table: table.to_string(),
                    reason: format!(
                        "unsupported arrow type {:?} for column '{}'",
                        field.data_type(),
                        field.name()
                    ),
                }
            })?;
            columns.push(ColumnDef {
                name: field.name().clone(),
                dtype,
                nullable: field.is_nullable(),
            });
        }
        Ok(TableSchema { columns })
    }

    pub fn to_arrow(&self) -> Arc<Schema> {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(&c.name, c.dtype.to_arrow(), c.nullable))
            .collect();
        Arc::new(Schema::new(fields))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Widens this schema with an incoming write's schema.
    ///
    /// Existing columns must keep their type; columns the incoming batch does
    /// not carry stay in place (they read back as null for new partitions).
    /// Columns new to the table are appended and recorded nullable, since
    /// every partition written before them lacks their values.
    pub fn widen(&self, table: &str, incoming: &TableSchema) -> Result<TableSchema, StoreError> {
        let mut merged = self.clone();
        for col in &mut merged.columns {
            // Partitions written from here on lack this column entirely.
            if incoming.column(&col.name).is_none() {
                col.nullable = true;
            }
        }
        for col in &incoming.columns {
            match merged.columns.iter_mut().find(|c| c.name == col.name) {
                Some(existing) => {
                    if existing.dtype != col.dtype {
                        return Err(StoreError::SchemaConflict {
                            table: table.to_string(),
                            reason: format!(
                                "column '{}' is {} but incoming data has {}",
                                col.name, existing.dtype, col.dtype
                            ),
                        });
                    }
                    // Nullability only ever widens; a table that accepted a
                    // nullable write must keep reading back as nullable.
                    existing.nullable |= col.nullable;
                }
                None => merged.columns.push(ColumnDef {
                    name: col.name.clone(),
                    dtype: col.dtype,
                    nullable: true,
                }),
            }
        }
        Ok(merged)
    }
}

/// Aligns a batch read from one partition to the table's current (possibly
/// widened) schema: columns the file lacks come back as nulls, column order
/// follows the table schema.
pub fn align_batch(batch: &RecordBatch, target: &Arc<Schema>) -> Result<RecordBatch, StoreError> {
    let columns = target
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(col) => col.clone(),
            None => new_null_array(field.data_type(), batch.num_rows()),
        })
        .collect();
    Ok(RecordBatch::try_new(target.clone(), columns)?)
}
