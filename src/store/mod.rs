//! Partitioned on-disk storage for columnar tables.
//!
//! One logical table maps to a directory tree under the store root; leaf
//! directories are partitions keyed by one or more partition columns
//! (`<root>/<table>/<col>=<value>/data.arrow`). A per-table manifest records
//! the schema commitment and the set of valid partitions, and is the source
//! of truth for gap-fill resolution.

use std::io;
use std::path::PathBuf;

mod manifest;
mod partition;
mod predicate;
mod scalar;
mod schema;
mod table;

#[cfg(test)]
mod tests;

pub use manifest::{Manifest, PartitionEntry};
pub use partition::PartitionKey;
pub use predicate::{CmpOp, ColumnFilter, KeyConstraint, Predicate};
pub use scalar::{date_to_days, days_to_date, ScalarValue};
pub use schema::{ColumnDef, ColumnType, TableSchema};
pub use table::{PartitionStore, StoreStats};

/// Common error type for storage operations
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Schema conflict on table '{table}': {reason}")]
    SchemaConflict { table: String, reason: String },
    #[error("Table not found: {0}")]
    TableNotFound(String),
    #[error("Partial write detected in table '{table}', partition '{key}'")]
    PartialWriteDetected { table: String, key: String },
    #[error("Invalid partition key: {0}")]
    InvalidPartition(String),
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Resolved storage settings. Loading these from a settings file is the
/// caller's job; the store only consumes the values.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Root directory under which all table trees live.
    pub root: PathBuf,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}
