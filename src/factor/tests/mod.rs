
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::array::{Array, Date32Array, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use tempfile::TempDir;

use super::*;
use crate::query::Database;
use crate::store::{date_to_days, PartitionStore, StoreConfig};

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn value_batch(value: f64) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new(
        "value",
        DataType::Float64,
        false,
    )]));
    RecordBatch::try_new(schema, vec![Arc::new(Float64Array::from(vec![value]))]).unwrap()
}

fn engine() -> (FactorEngine, Database, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PartitionStore::open(StoreConfig::new(dir.path())).unwrap());
    let db = Database::new(store);
    (FactorEngine::new(db.clone()), db, dir)
}

/// A factor that counts its own invocations.
fn counting_factor(
    name: &str,
    deps: Vec<String>,
    value: f64,
) -> (Factor, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_fn = calls.clone();
    let func: FactorFn = Arc::new(move |_ctx| {
        calls_in_fn.fetch_add(1, Ordering::SeqCst);
        Ok(value_batch(value))
    });
    (Factor::new(name, deps, Frequency::Daily, func), calls)
}

#[test]
fn compute_persists_under_the_conventional_table() {
    let (engine, db, _dir) = engine();
    let (factor, _) = counting_factor("mom_5d", vec![], 1.25);
    engine.register(factor).unwrap();

    let batch = engine
        .compute("mom_5d", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap();
    assert_eq!(batch.num_rows(), 1);

    assert!(db.store().exists("factors/mom_5d"));
    assert_eq!(
        db.store().list_partitions("factors/mom_5d").unwrap(),
        vec!["date=2024-03-01"]
    );
}

#[test]
fn factor_output_is_queryable_like_any_table() {
    let (engine, db, _dir) = engine();
    let (factor, _) = counting_factor("mom_5d", vec![], 1.25);
    engine.register(factor).unwrap();
    engine
        .compute("mom_5d", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap();

    let batch = db
        .sql(r#"SELECT value FROM "factors/mom_5d" WHERE date = '2024-03-01'"#)
        .unwrap();
    assert_eq!(batch.num_rows(), 1);
    let values = batch
        .column(0)
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    assert_eq!(values.value(0), 1.25);
}

#[test]
fn dependencies_compute_before_dependents() {
    let (engine, _db, _dir) = engine();
    let (factor_a, calls_a) = counting_factor("a", vec![], 1.0);
    let (factor_b, calls_b) = counting_factor("b", vec!["a".to_string()], 2.0);
    engine.register(factor_a).unwrap();
    engine.register(factor_b).unwrap();

    engine
        .compute("b", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap();
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);

    // Second call: both cached, nothing recomputes.
    engine
        .compute("b", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap();
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
}

#[test]
fn force_recomputes_the_target() {
    let (engine, _db, _dir) = engine();
    let (factor, calls) = counting_factor("f", vec![], 1.0);
    engine.register(factor).unwrap();

    engine
        .compute("f", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap();
    engine
        .compute("f", date("2024-03-01"), &FactorArgs::new(), true)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn distinct_dates_are_distinct_cache_entries() {
    let (engine, _db, _dir) = engine();
    let (factor, calls) = counting_factor("f", vec![], 1.0);
    engine.register(factor).unwrap();

    engine
        .compute("f", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap();
    engine
        .compute("f", date("2024-03-02"), &FactorArgs::new(), false)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn distinct_args_are_distinct_cache_entries() {
    let (engine, db, _dir) = engine();
    let (factor, calls) = counting_factor("f", vec![], 1.0);
    engine.register(factor).unwrap();

    let mut args = FactorArgs::new();
    args.insert("cutoff".to_string(), "10:30".to_string());
    engine
        .compute("f", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap();
    engine
        .compute("f", date("2024-03-01"), &args, false)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(db.store().exists("factors/f/cutoff=10:30"));
}

#[test]
fn self_cycle_is_rejected_at_registration() {
    let (engine, _db, _dir) = engine();
    let (factor, _) = counting_factor("loop", vec!["loop".to_string()], 1.0);
    let err = engine.register(factor).unwrap_err();
    assert!(matches!(err, FactorError::CyclicDependency(_)));
}

#[test]
fn indirect_cycle_is_rejected_and_rolled_back() {
    let (engine, _db, _dir) = engine();
    let (factor_a, _) = counting_factor("a", vec!["b".to_string()], 1.0);
    let (factor_b, _) = counting_factor("b", vec!["a".to_string()], 2.0);
    // "a" registers fine: "b" is still an unregistered (raw table) name.
    engine.register(factor_a).unwrap();
    let err = engine.register(factor_b).unwrap_err();
    assert!(matches!(err, FactorError::CyclicDependency(_)));

    // The failed registration must not leave "b" behind.
    assert!(engine.get("b").is_none());
    assert!(engine.get("a").is_some());
}

#[test]
fn unknown_factor_is_reported() {
    let (engine, _db, _dir) = engine();
    let err = engine
        .compute("nope", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap_err();
    assert!(matches!(err, FactorError::UnknownFactor(_)));
}

#[test]
fn query_failure_inside_a_factor_fn_propagates() {
    let (engine, _db, _dir) = engine();
    let func: FactorFn = Arc::new(|ctx| {
        // The dependency table was never populated; `?` carries the query
        // error straight out of the factor function.
        let missing = ctx.db.sql(r#"SELECT * FROM "no/such/table""#)?;
        Ok(missing)
    });
    engine
        .register(Factor::new("broken", vec![], Frequency::Daily, func))
        .unwrap();

    let err = engine
        .compute("broken", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap_err();
    assert!(matches!(err, FactorError::Query(_)));
}

#[test]
fn factor_can_read_its_dependencies_through_the_db() {
    let (engine, db, _dir) = engine();

    // Seed a raw table the factor depends on.
    let schema = Arc::new(Schema::new(vec![
        Field::new("date", DataType::Date32, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("close", DataType::Float64, false),
    ]));
    let raw = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Date32Array::from(vec![date_to_days(date("2024-03-01")); 2])),
            Arc::new(StringArray::from(vec!["IF2406", "IC2406"])),
            Arc::new(Float64Array::from(vec![100.0, 200.0])),
        ],
    )
    .unwrap();
    db.store()
        .put(&raw, "market_data/kline_daily", &["date"])
        .unwrap();

    let func: FactorFn = Arc::new(|ctx| {
        let bars = ctx.db.sql(&format!(
            r#"SELECT close FROM "market_data/kline_daily" WHERE date = '{}'"#,
            ctx.date.format("%Y-%m-%d")
        ))?;
        let closes = bars
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        let total: f64 = closes.iter().flatten().sum();
        Ok(value_batch(total))
    });
    engine
        .register(Factor::new(
            "close_sum",
            vec!["market_data/kline_daily".to_string()],
            Frequency::Daily,
            func,
        ))
        .unwrap();

    let batch = engine
        .compute("close_sum", date("2024-03-01"), &FactorArgs::new(), false)
        .unwrap();
    let values = batch
        .column_by_name("value")
        .unwrap()
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap();
    assert_eq!(values.value(0), 300.0);
}
