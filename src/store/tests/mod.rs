
use super::*;
use arrow::{
    array::{Date32Array, Float64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use chrono::NaiveDate;
use std::sync::Arc;
use tempfile::TempDir;

pub fn test_store() -> (PartitionStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::open(StoreConfig::new(dir.path())).unwrap();
    (store, dir)
}

pub fn bar_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("date", DataType::Date32, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("close", DataType::Float64, false),
    ]))
}

pub fn days(date: &str) -> i32 {
    date_to_days(NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap())
}

/// One row per (date, close) pair, all under the same symbol.
pub fn bars(dates: Vec<&str>, closes: Vec<f64>) -> RecordBatch {
    let date_array = Date32Array::from(dates.iter().map(|d| days(d)).collect::<Vec<_>>());
    let symbol_array = StringArray::from(vec!["IF2406"; closes.len()]);
    let close_array = Float64Array::from(closes);
    RecordBatch::try_new(
        bar_schema(),
        vec![
            Arc::new(date_array),
            Arc::new(symbol_array),
            Arc::new(close_array),
        ],
    )
    .unwrap()
}
