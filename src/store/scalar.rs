use arrow::array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampNanosecondArray,
};
use chrono::NaiveDate;
use std::sync::Arc;

/// A single literal value, carried in the semantic type system of the store.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    /// Days since the unix epoch.
    Date32(i32),
    TimestampNanosecond(i64),
    Null,
}

impl ScalarValue {
    /// Convert scalar to an Arrow array of `len` repeated values for
    /// comparison kernels.
    pub fn to_array(&self, len: usize) -> ArrayRef {
        match self {
            ScalarValue::Int64(i) => Arc::new(Int64Array::from(vec![*i; len])) as ArrayRef,
            ScalarValue::Float64(f) => Arc::new(Float64Array::from(vec![*f; len])) as ArrayRef,
            ScalarValue::Utf8(s) => {
                Arc::new(StringArray::from(vec![s.as_str(); len])) as ArrayRef
            }
            ScalarValue::Boolean(b) => Arc::new(BooleanArray::from(vec![*b; len])) as ArrayRef,
            ScalarValue::Date32(days) => {
                Arc::new(Date32Array::from(vec![*days; len])) as ArrayRef
            }
            ScalarValue::TimestampNanosecond(ts) => {
                Arc::new(TimestampNanosecondArray::from(vec![*ts; len])) as ArrayRef
            }
            ScalarValue::Null => Arc::new(Float64Array::from(vec![None::<f64>; len])) as ArrayRef,
        }
    }

    /// Renders the scalar the way partition key values render on disk.
    pub fn render(&self) -> String {
        match self {
            ScalarValue::Int64(i) => i.to_string(),
            ScalarValue::Float64(f) => f.to_string(),
            ScalarValue::Utf8(s) => s.clone(),
            ScalarValue::Boolean(b) => b.to_string(),
            ScalarValue::Date32(days) => days_to_date(*days).format("%Y-%m-%d").to_string(),
            ScalarValue::TimestampNanosecond(ts) => ts.to_string(),
            ScalarValue::Null => "null".to_string(),
        }
    }
}

fn unix_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
}

pub fn date_to_days(date: NaiveDate) -> i32 {
    (date - unix_epoch()).num_days() as i32
}

pub fn days_to_date(days: i32) -> NaiveDate {
    unix_epoch() + chrono::Duration::days(days as i64)
}
