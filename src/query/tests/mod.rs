use std::sync::Arc;

use arrow::array::{Array, Date32Array, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;

use super::*;
use crate::store::{date_to_days, PartitionStore, StoreConfig};

fn days(date: &str) -> i32 {
    date_to_days(NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap())
}

fn seeded_db() -> (Database, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PartitionStore::open(StoreConfig::new(dir.path())).unwrap());

    let schema = Arc::new(Schema::new(vec![
        Field::new("date", DataType::Date32, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("close", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Date32Array::from(vec![
                days("2025-05-05"),
                days("2025-05-06"),
                days("2025-05-06"),
                days("2025-05-07"),
            ])),
            Arc::new(StringArray::from(vec!["IF2406", "IF2406", "IC2406", "IF2406"])),
            Arc::new(Float64Array::from(vec![100.0, 101.0, 99.5, 103.0])),
        ],
    )
    .unwrap();
    store
        .put(&batch, "market_data/kline_daily", &["date"])
        .unwrap();

    (Database::new(store), dir)
}

#[test]
fn select_star() {
    let (db, _dir) = seeded_db();
    let batch = db.sql(r#"SELECT * FROM "market_data/kline_daily""#).unwrap();
    assert_eq!(batch.num_rows(), 4);
    assert_eq!(batch.num_columns(), 3);
}

#[test]
fn select_projection() {
    let (db, _dir) = seeded_db();
    let batch = db
        .sql(r#"SELECT symbol, close FROM "market_data/kline_daily""#)
        .unwrap();
    assert_eq!(batch.num_columns(), 2);
    assert_eq!(batch.schema().field(0).name(), "symbol");
    assert_eq!(batch.schema().field(1).name(), "close");
}

#[test]
fn where_on_partition_column_prunes() {
    let (db, _dir) = seeded_db();
    let before = db.store().stats().files_opened;
    let batch = db
        .sql(r#"SELECT * FROM "market_data/kline_daily" WHERE date = '2025-05-06'"#)
        .unwrap();
    let after = db.store().stats().files_opened;

    assert_eq!(batch.num_rows(), 2);
    assert_eq!(after - before, 1, "only the matching partition is read");
}

#[test]
fn where_mixes_partition_and_row_predicates() {
    let (db, _dir) = seeded_db();
    let batch = db
        .sql(
            r#"SELECT symbol FROM "market_data/kline_daily"
               WHERE date >= '2025-05-06' AND close > 100.0"#,
        )
        .unwrap();
    assert_eq!(batch.num_rows(), 2);
}

#[test]
fn where_on_string_column() {
    let (db, _dir) = seeded_db();
    let batch = db
        .sql(r#"SELECT * FROM "market_data/kline_daily" WHERE symbol = 'IC2406'"#)
        .unwrap();
    assert_eq!(batch.num_rows(), 1);
}

#[test]
fn order_by_and_limit() {
    let (db, _dir) = seeded_db();
    let batch = db
        .sql(r#"SELECT close FROM "market_data/kline_daily" ORDER BY close DESC LIMIT 2"#)
        .unwrap();
    assert_eq!(batch.num_rows(), 2);
    let closes = batch
        .column(0)
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    assert_eq!(closes.value(0), 103.0);
    assert_eq!(closes.value(1), 101.0);
}

#[test]
fn limit_larger_than_result_is_noop() {
    let (db, _dir) = seeded_db();
    let batch = db
        .sql(r#"SELECT * FROM "market_data/kline_daily" LIMIT 100"#)
        .unwrap();
    assert_eq!(batch.num_rows(), 4);
}

#[test]
fn malformed_sql_is_a_parse_error() {
    let (db, _dir) = seeded_db();
    let err = db.sql("SELEC close FROM t").unwrap_err();
    assert!(matches!(err, QueryError::Parse(_)));
}

#[test]
fn joins_are_unsupported() {
    let (db, _dir) = seeded_db();
    let err = db
        .sql(r#"SELECT * FROM "a" JOIN "b" ON a.x = b.x"#)
        .unwrap_err();
    assert!(matches!(err, QueryError::Unsupported(_)));
}

#[test]
fn or_predicates_are_unsupported() {
    let (db, _dir) = seeded_db();
    let err = db
        .sql(r#"SELECT * FROM "market_data/kline_daily" WHERE close > 1.0 OR close < 0.5"#)
        .unwrap_err();
    assert!(matches!(err, QueryError::Unsupported(_)));
}

#[test]
fn unknown_table_propagates_from_store() {
    let (db, _dir) = seeded_db();
    let err = db.sql(r#"SELECT * FROM "no/such/table""#).unwrap_err();
    assert!(matches!(err, QueryError::Store(StoreError::TableNotFound(_))));
}

#[test]
fn unknown_column_is_reported() {
    let (db, _dir) = seeded_db();
    let err = db
        .sql(r#"SELECT nope FROM "market_data/kline_daily""#)
        .unwrap_err();
    assert!(matches!(err, QueryError::UnknownColumn(_)));
}
