use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use super::manifest::Manifest;
use super::partition::{
    group_by_partition_key, is_temp_file, read_partition_file, take_rows, write_partition_file,
    PartitionKey, DATA_FILE,
};
use super::predicate::Predicate;
use super::schema::{align_batch, TableSchema};
use super::{StoreConfig, StoreError};

/// Counters kept by the store. Tests use `files_opened` to verify that
/// pruned queries never touch files outside the selected partitions.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub files_opened: usize,
    pub partitions_written: usize,
}

struct TableHandle {
    dir: PathBuf,
    manifest: Mutex<Manifest>,
    // One writer per partition at a time; keyed by rendered partition key.
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TableHandle {
    fn partition_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Owner of the on-disk partition layout. All reads and writes of table data
/// go through here; callers never hold raw file handles across operations.
pub struct PartitionStore {
    root: PathBuf,
    tables: Mutex<HashMap<String, Arc<TableHandle>>>,
    files_opened: AtomicUsize,
    partitions_written: AtomicUsize,
}

impl PartitionStore {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.root)?;
        Ok(Self {
            root: config.root,
            tables: Mutex::new(HashMap::new()),
            files_opened: AtomicUsize::new(0),
            partitions_written: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            files_opened: self.files_opened.load(Ordering::Relaxed),
            partitions_written: self.partitions_written.load(Ordering::Relaxed),
        }
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    /// Returns the cached handle for an existing table, loading (and crash-
    /// recovering) its manifest on first access.
    fn handle(&self, table: &str) -> Result<Arc<TableHandle>, StoreError> {
        if let Some(handle) = self.tables.lock().get(table) {
            return Ok(handle.clone());
        }
        let dir = self.table_dir(table);
        let Some(mut manifest) = Manifest::load(&dir)? else {
            return Err(StoreError::TableNotFound(table.to_string()));
        };
        let recovered = recover_table(&dir, &mut manifest)?;
        if !recovered.is_empty() {
            manifest.save(&dir)?;
        }
        let handle = Arc::new(TableHandle {
            dir,
            manifest: Mutex::new(manifest),
            write_locks: Mutex::new(HashMap::new()),
        });
        self.tables
            .lock()
            .entry(table.to_string())
            .or_insert(handle.clone());
        Ok(handle)
    }

    fn handle_or_create(
        &self,
        table: &str,
        partition_columns: &[String],
        schema: &TableSchema,
    ) -> Result<Arc<TableHandle>, StoreError> {
        match self.handle(table) {
            Ok(handle) => Ok(handle),
            Err(StoreError::TableNotFound(_)) => {
                let dir = self.table_dir(table);
                let manifest = Manifest::new(table, partition_columns.to_vec(), schema.clone());
                let handle = Arc::new(TableHandle {
                    dir,
                    manifest: Mutex::new(manifest),
                    write_locks: Mutex::new(HashMap::new()),
                });
                // Another writer may have created it in between; first one wins.
                Ok(self
                    .tables
                    .lock()
                    .entry(table.to_string())
                    .or_insert(handle)
                    .clone())
            }
            Err(e) => Err(e),
        }
    }

    /// Writes a batch into the table, grouped by partition key. Each affected
    /// partition is atomically replaced; the manifest is updated after every
    /// successful partition write so an interrupted put leaves only complete
    /// partitions behind.
    pub fn put(
        &self,
        batch: &RecordBatch,
        table: &str,
        partition_columns: &[&str],
    ) -> Result<(), StoreError> {
        let incoming = TableSchema::from_arrow(table, batch.schema().as_ref())?;
        let columns: Vec<String> = partition_columns.iter().map(|s| s.to_string()).collect();
        // Reject before any manifest lands, so a bad write cannot poison the
        // table name with a partition-column list the data never had.
        for col in &columns {
            if batch.column_by_name(col).is_none() {
                return Err(StoreError::InvalidPartition(format!(
                    "partition column '{}' not in data",
                    col
                )));
            }
        }
        let handle = self.handle_or_create(table, &columns, &incoming)?;

        {
            let mut manifest = handle.manifest.lock();
            if manifest.partition_columns != columns {
                return Err(StoreError::SchemaConflict {
                    table: table.to_string(),
                    reason: format!(
                        "table is partitioned by {:?}, write used {:?}",
                        manifest.partition_columns, columns
                    ),
                });
            }
            manifest.schema = manifest.schema.widen(table, &incoming)?;
            manifest.save(&handle.dir)?;
        }

        let groups = group_by_partition_key(batch, &columns)?;
        for (key, rows) in groups {
            let partition_batch = take_rows(batch, &rows)?;
            let rendered = key.render();

            let lock = handle.partition_lock(&rendered);
            let _writer = lock.lock();
            write_partition_file(&partition_dir(&handle.dir, &key), &partition_batch)?;
            self.partitions_written.fetch_add(1, Ordering::Relaxed);

            // Metadata mutation under the table lock only; the data write
            // above happened outside it.
            let mut manifest = handle.manifest.lock();
            manifest.record_partition(
                rendered,
                partition_batch.num_rows(),
                vec![DATA_FILE.to_string()],
            );
            manifest.save(&handle.dir)?;
        }
        Ok(())
    }

    /// Reads the table as a single batch: prunes partitions by the key part
    /// of the predicate, loads the survivors, aligns them to the current
    /// table schema and applies row filters.
    pub fn read(&self, table: &str, predicate: &Predicate) -> Result<RecordBatch, StoreError> {
        let handle = self.handle(table)?;
        let (arrow_schema, candidates) = {
            let manifest = handle.manifest.lock();
            let schema = manifest.schema.to_arrow();
            let keys: Vec<String> = manifest.partitions.keys().cloned().collect();
            (schema, keys)
        };

        let mut batches = Vec::new();
        for rendered in candidates {
            let key = PartitionKey::parse(&rendered)?;
            if !predicate.matches_key(&key) {
                continue;
            }
            match self.load_partition(&handle, table, &key) {
                Ok(partition_batches) => {
                    for b in partition_batches {
                        batches.push(align_batch(&b, &arrow_schema)?);
                    }
                }
                Err(StoreError::PartialWriteDetected { table, key }) => {
                    // Treated as absent until rewritten.
                    log::warn!("skipping partial partition {}/{}", table, key);
                }
                Err(e) => return Err(e),
            }
        }

        let combined = if batches.is_empty() {
            RecordBatch::new_empty(arrow_schema.clone())
        } else {
            arrow::compute::concat_batches(&arrow_schema, batches.iter())?
        };

        match predicate.row_mask(&combined)? {
            Some(mask) => Ok(arrow::compute::filter_record_batch(&combined, &mask)?),
            None => Ok(combined),
        }
    }

    fn load_partition(
        &self,
        handle: &TableHandle,
        table: &str,
        key: &PartitionKey,
    ) -> Result<Vec<RecordBatch>, StoreError> {
        let files = {
            let manifest = handle.manifest.lock();
            match manifest.partitions.get(&key.render()) {
                Some(entry) => entry.files.clone(),
                None => return Ok(Vec::new()),
            }
        };
        let dir = partition_dir(&handle.dir, key);
        let mut batches = Vec::new();
        for file in files {
            let path = dir.join(&file);
            if !path.exists() {
                return Err(StoreError::PartialWriteDetected {
                    table: table.to_string(),
                    key: key.render(),
                });
            }
            self.files_opened.fetch_add(1, Ordering::Relaxed);
            batches.extend(read_partition_file(&path)?);
        }
        Ok(batches)
    }

    /// Metadata-only: does the table exist on disk?
    pub fn exists(&self, table: &str) -> bool {
        if self.tables.lock().contains_key(table) {
            return true;
        }
        Manifest::path(&self.table_dir(table)).exists()
    }

    /// Metadata-only: rendered keys of all valid partitions, in key order.
    pub fn list_partitions(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let handle = self.handle(table)?;
        let manifest = handle.manifest.lock();
        Ok(manifest.partitions.keys().cloned().collect())
    }

    pub fn schema(&self, table: &str) -> Result<TableSchema, StoreError> {
        let handle = self.handle(table)?;
        Ok(handle.manifest.lock().schema.clone())
    }

    pub fn partition_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let handle = self.handle(table)?;
        Ok(handle.manifest.lock().partition_columns.clone())
    }

    /// Re-runs the crash-recovery scan: removes temp-file litter and drops
    /// manifest entries whose data files disappeared. Returns the rendered
    /// keys of partitions that were found in an intermediate state.
    pub fn recover(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let handle = self.handle(table)?;
        let mut manifest = handle.manifest.lock();
        let recovered = recover_table(&handle.dir, &mut manifest)?;
        if !recovered.is_empty() {
            manifest.save(&handle.dir)?;
        }
        Ok(recovered)
    }
}

fn partition_dir(table_dir: &Path, key: &PartitionKey) -> PathBuf {
    let rendered = key.render();
    if rendered.is_empty() {
        // Unpartitioned table: data lives directly under the table root.
        table_dir.to_path_buf()
    } else {
        table_dir.join(rendered)
    }
}

/// Crash-recovery scan. Partitions left in an intermediate state (temp files
/// from an interrupted write, or manifest entries whose files are gone) are
/// cleaned up and reported; they read as absent until rewritten.
fn recover_table(dir: &Path, manifest: &mut Manifest) -> Result<Vec<String>, StoreError> {
    let mut touched = Vec::new();

    remove_temp_litter(dir, dir, &mut touched)?;

    let mut dangling = Vec::new();
    for (rendered, entry) in &manifest.partitions {
        let key = PartitionKey::parse(rendered)?;
        let pdir = partition_dir(dir, &key);
        if entry.files.iter().any(|f| !pdir.join(f).exists()) {
            dangling.push(rendered.clone());
        }
    }
    for rendered in dangling {
        log::warn!(
            "partial write detected in table '{}', partition '{}': dropping manifest entry",
            manifest.table,
            rendered
        );
        manifest.partitions.remove(&rendered);
        touched.push(rendered);
    }

    touched.sort();
    touched.dedup();
    Ok(touched)
}

fn remove_temp_litter(root: &Path, dir: &Path, touched: &mut Vec<String>) -> Result<(), StoreError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            remove_temp_litter(root, &path, touched)?;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if is_temp_file(name) {
                log::warn!("removing leftover temp file {}", path.display());
                std::fs::remove_file(&path)?;
                if let Some(rel) = path.parent().and_then(|p| p.strip_prefix(root).ok()) {
                    touched.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
    }
    Ok(())
}
