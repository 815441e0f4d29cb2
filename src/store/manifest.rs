use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::partition::temp_path_for;
use super::schema::TableSchema;
use super::StoreError;

pub const MANIFEST_FILE: &str = "_manifest.json";

/// Metadata for one valid partition. A partition counts as valid only while
/// its manifest entry and its files agree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub row_count: usize,
    pub files: Vec<String>,
    pub last_write: DateTime<Utc>,
}

/// Per-table metadata index: the schema commitment plus the set of valid
/// partition keys. The manifest, not the directory tree, is what gap-fill
/// resolution and pruning consult.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub table: String,
    pub partition_columns: Vec<String>,
    pub schema: TableSchema,
    /// Rendered partition key -> entry, ordered so date-keyed partitions
    /// list chronologically.
    pub partitions: BTreeMap<String, PartitionEntry>,
}

impl Manifest {
    pub fn new(table: &str, partition_columns: Vec<String>, schema: TableSchema) -> Self {
        Self {
            table: table.to_string(),
            partition_columns,
            schema,
            partitions: BTreeMap::new(),
        }
    }

    pub fn path(table_dir: &Path) -> PathBuf {
        table_dir.join(MANIFEST_FILE)
    }

    pub fn load(table_dir: &Path) -> Result<Option<Manifest>, StoreError> {
        let path = Self::path(table_dir);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Saves with the same temp-then-rename discipline as partition data, so
    /// a crash never leaves a half-written manifest behind.
    pub fn save(&self, table_dir: &Path) -> Result<(), StoreError> {
        std::fs::create_dir_all(table_dir)?;
        let path = Self::path(table_dir);
        let temp = temp_path_for(table_dir, MANIFEST_FILE);
        std::fs::write(&temp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&temp, &path)?;
        Ok(())
    }

    pub fn record_partition(&mut self, key: String, row_count: usize, files: Vec<String>) {
        self.partitions.insert(
            key,
            PartitionEntry {
                row_count,
                files,
                last_write: Utc::now(),
            },
        );
    }

    /// Latest partition key in key order. For date-partitioned tables this is
    /// the most recent stored date.
    pub fn latest_partition(&self) -> Option<&str> {
        self.partitions.keys().next_back().map(|k| k.as_str())
    }
}
