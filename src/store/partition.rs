use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use arrow::array::{
    Array, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampNanosecondArray,
};
use arrow::datatypes::DataType;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use rand::distr::Alphanumeric;
use rand::{rng, Rng};

use super::scalar::days_to_date;
use super::StoreError;

pub const DATA_FILE: &str = "data.arrow";
const TMP_MARKER: &str = ".tmp-";

/// One value-tuple of a table's partition columns, ordered as declared.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    parts: Vec<(String, String)>,
}

impl PartitionKey {
    pub fn new(parts: Vec<(String, String)>) -> Self {
        Self { parts }
    }

    pub fn value(&self, column: &str) -> Option<&str> {
        self.parts
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn parts(&self) -> &[(String, String)] {
        &self.parts
    }

    /// Hive-style rendering, `date=2024-01-02/symbol=IF2406`. Doubles as the
    /// relative directory path of the partition under the table root.
    pub fn render(&self) -> String {
        self.parts
            .iter()
            .map(|(c, v)| format!("{}={}", c, sanitize(v)))
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn parse(rendered: &str) -> Result<PartitionKey, StoreError> {
        // An unpartitioned table has exactly one partition, the empty key.
        if rendered.is_empty() {
            return Ok(PartitionKey { parts: Vec::new() });
        }
        let mut parts = Vec::new();
        for seg in rendered.split('/') {
            let (col, val) = seg
                .split_once('=')
                .ok_or_else(|| StoreError::InvalidPartition(rendered.to_string()))?;
            parts.push((col.to_string(), val.to_string()));
        }
        Ok(PartitionKey { parts })
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

fn sanitize(value: &str) -> String {
    value.replace(['/', '\\'], "_")
}

/// Renders one cell of a partition column as its on-disk key value.
/// Dates render ISO so lexicographic order matches chronological order.
pub fn render_cell(array: &dyn Array, row: usize) -> Result<String, StoreError> {
    if array.is_null(row) {
        return Ok("null".to_string());
    }
    let rendered = match array.data_type() {
        DataType::Utf8 => {
            let arr = array.as_any().downcast_ref::<StringArray>().unwrap();
            arr.value(row).to_string()
        }
        DataType::Int64 => {
            let arr = array.as_any().downcast_ref::<Int64Array>().unwrap();
            arr.value(row).to_string()
        }
        DataType::Float64 => {
            let arr = array.as_any().downcast_ref::<Float64Array>().unwrap();
            arr.value(row).to_string()
        }
        DataType::Boolean => {
            let arr = array.as_any().downcast_ref::<BooleanArray>().unwrap();
            arr.value(row).to_string()
        }
        DataType::Date32 => {
            let arr = array.as_any().downcast_ref::<Date32Array>().unwrap();
            days_to_date(arr.value(row)).format("%Y-%m-%d").to_string()
        }
        DataType::Timestamp(_, _) => {
            let arr = array
                .as_any()
                .downcast_ref::<TimestampNanosecondArray>()
                .unwrap();
            arr.value(row).to_string()
        }
        other => {
            return Err(StoreError::InvalidPartition(format!(
                "unsupported partition column type {:?}",
                other
            )))
        }
    };
    Ok(rendered)
}

/// Groups a batch's rows by partition-key tuple. Returns, per key, the row
/// indices belonging to it in input order.
pub fn group_by_partition_key(
    batch: &RecordBatch,
    partition_columns: &[String],
) -> Result<BTreeMap<PartitionKey, Vec<usize>>, StoreError> {
    let mut arrays = Vec::with_capacity(partition_columns.len());
    for col in partition_columns {
        let array = batch.column_by_name(col).ok_or_else(|| {
            StoreError::InvalidPartition(format!("partition column '{}' not in data", col))
        })?;
        arrays.push((col.clone(), array.clone()));
    }

    let mut groups: BTreeMap<PartitionKey, Vec<usize>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let mut parts = Vec::with_capacity(arrays.len());
        for (col, array) in &arrays {
            parts.push((col.clone(), render_cell(array.as_ref(), row)?));
        }
        groups
            .entry(PartitionKey::new(parts))
            .or_default()
            .push(row);
    }
    Ok(groups)
}

/// Selects the given rows into a new batch using the `take` kernel.
pub fn take_rows(batch: &RecordBatch, row_indices: &[usize]) -> Result<RecordBatch, StoreError> {
    let indices = arrow::array::UInt32Array::from(
        row_indices.iter().map(|&i| i as u32).collect::<Vec<_>>(),
    );
    let columns: Vec<_> = batch
        .columns()
        .iter()
        .map(|col| arrow::compute::take(col.as_ref(), &indices, None))
        .collect::<Result<_, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), columns)?)
}

/// Atomically replaces a partition's data file: write to a temp name in the
/// same directory, then rename over the final name. Readers holding the old
/// file keep a consistent view; new readers see the new file.
pub fn write_partition_file(dir: &Path, batch: &RecordBatch) -> Result<PathBuf, StoreError> {
    std::fs::create_dir_all(dir)?;
    let final_path = dir.join(DATA_FILE);
    let temp_path = temp_path_for(dir, DATA_FILE);

    let file = std::fs::File::create(&temp_path)?;
    let mut writer = FileWriter::try_new(file, batch.schema().as_ref())?;
    writer.write(batch)?;
    writer.finish()?;
    std::fs::rename(&temp_path, &final_path)?;

    Ok(final_path)
}

pub fn read_partition_file(path: &Path) -> Result<Vec<RecordBatch>, StoreError> {
    let file = std::fs::File::open(path)?;
    let reader = FileReader::try_new(file, None)?;
    let mut batches = Vec::new();
    for maybe_batch in reader {
        batches.push(maybe_batch?);
    }
    Ok(batches)
}

pub fn is_temp_file(name: &str) -> bool {
    name.contains(TMP_MARKER)
}

/// Temp name next to the final file, carrying the marker the recovery sweep
/// looks for, so an interrupted write is always cleanable.
pub fn temp_path_for(dir: &Path, final_name: &str) -> PathBuf {
    dir.join(format!("{}{}{}", final_name, TMP_MARKER, random_suffix(10)))
}

fn random_suffix(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
