//! Expression mini-language for derived columns.
//!
//! One expression names a column transform and its output alias, e.g.
//! `ind_pct(close, 1) as roc`. A batch of expressions evaluates left to
//! right against an in-memory dataset, so a later expression may reference
//! an alias defined earlier in the same batch.

use std::sync::Arc;

use arrow::array::{Array, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field};
use arrow::record_batch::RecordBatch;

use crate::store::StoreError;

use super::FactorError;

#[derive(Clone, Debug, PartialEq)]
pub enum ExprArg {
    Column(String),
    Number(f64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedExpr {
    pub alias: String,
    pub func: String,
    pub args: Vec<ExprArg>,
}

/// Parses `func(arg, ...) as alias`. Arguments are column/alias names or
/// numeric literals; nesting is not part of the language.
pub fn parse_expr(text: &str) -> Result<ParsedExpr, FactorError> {
    let (call, alias) = split_alias(text)
        .ok_or_else(|| FactorError::ExprParse(format!("missing 'as <alias>' in '{}'", text)))?;

    let open = call
        .find('(')
        .ok_or_else(|| FactorError::ExprParse(format!("expected a function call in '{}'", text)))?;
    if !call.ends_with(')') {
        return Err(FactorError::ExprParse(format!(
            "unbalanced parentheses in '{}'",
            text
        )));
    }
    let func = call[..open].trim();
    if func.is_empty() || !is_identifier(func) {
        return Err(FactorError::ExprParse(format!(
            "invalid function name in '{}'",
            text
        )));
    }

    let inner = call[open + 1..call.len() - 1].trim();
    let mut args = Vec::new();
    if !inner.is_empty() {
        for raw in inner.split(',') {
            let raw = raw.trim();
            if let Ok(n) = raw.parse::<f64>() {
                args.push(ExprArg::Number(n));
            } else if is_identifier(raw) {
                args.push(ExprArg::Column(raw.to_string()));
            } else {
                return Err(FactorError::ExprParse(format!(
                    "invalid argument '{}' in '{}'",
                    raw, text
                )));
            }
        }
    }

    Ok(ParsedExpr {
        alias: alias.to_string(),
        func: func.to_string(),
        args,
    })
}

fn split_alias(text: &str) -> Option<(&str, &str)> {
    let lower = text.to_ascii_lowercase();
    let idx = lower.rfind(" as ")?;
    let call = text[..idx].trim();
    let alias = text[idx + 4..].trim();
    if alias.is_empty() || !is_identifier(alias) {
        return None;
    }
    Some((call, alias))
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Evaluates a batch of expressions against a dataset, appending one output
/// column per expression. Sequential: expression N sees the aliases of
/// expressions 0..N.
pub fn apply_exprs(batch: &RecordBatch, exprs: &[&str]) -> Result<RecordBatch, FactorError> {
    let mut current = batch.clone();
    for text in exprs {
        let parsed = parse_expr(text)?;
        let values = evaluate(&current, &parsed)?;
        current = append_column(&current, &parsed.alias, values)?;
    }
    Ok(current)
}

fn evaluate(batch: &RecordBatch, expr: &ParsedExpr) -> Result<Vec<Option<f64>>, FactorError> {
    match expr.func.as_str() {
        "ind_pct" => {
            let (series, lag) = column_and_window(batch, expr)?;
            Ok(pct_change(&series, lag))
        }
        "ind_shift" => {
            let (series, lag) = column_and_window(batch, expr)?;
            Ok(shift(&series, lag))
        }
        "ind_mean" => rolling(batch, expr, |window| mean(window)),
        "ind_sum" => rolling(batch, expr, |window| Some(window.iter().sum())),
        "ind_std" => rolling(batch, expr, |window| std_dev(window)),
        "ind_max" => rolling(batch, expr, |window| {
            window.iter().copied().reduce(f64::max)
        }),
        "ind_min" => rolling(batch, expr, |window| {
            window.iter().copied().reduce(f64::min)
        }),
        "ind_abs" => unary(batch, expr, f64::abs),
        "ind_log" => unary(batch, expr, f64::ln),
        other => Err(FactorError::UnknownExpressionFunction(other.to_string())),
    }
}

/// Pulls a numeric column (or earlier alias) out of the working batch.
fn numeric_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<f64>>, FactorError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| FactorError::UndefinedAlias(name.to_string()))?;
    match column.data_type() {
        DataType::Float64 => {
            let arr = column.as_any().downcast_ref::<Float64Array>().unwrap();
            Ok(arr.iter().collect())
        }
        DataType::Int64 => {
            let arr = column.as_any().downcast_ref::<Int64Array>().unwrap();
            Ok(arr.iter().map(|v| v.map(|i| i as f64)).collect())
        }
        other => Err(FactorError::ExprParse(format!(
            "column '{}' has non-numeric type {:?}",
            name, other
        ))),
    }
}

fn column_and_window(
    batch: &RecordBatch,
    expr: &ParsedExpr,
) -> Result<(Vec<Option<f64>>, usize), FactorError> {
    let [ExprArg::Column(name), ExprArg::Number(n)] = expr.args.as_slice() else {
        return Err(FactorError::ExprParse(format!(
            "{} expects (column, n)",
            expr.func
        )));
    };
    if *n < 1.0 || n.fract() != 0.0 {
        return Err(FactorError::ExprParse(format!(
            "{} expects a positive integer window, got {}",
            expr.func, n
        )));
    }
    Ok((numeric_column(batch, name)?, *n as usize))
}

fn unary(
    batch: &RecordBatch,
    expr: &ParsedExpr,
    f: fn(f64) -> f64,
) -> Result<Vec<Option<f64>>, FactorError> {
    let [ExprArg::Column(name)] = expr.args.as_slice() else {
        return Err(FactorError::ExprParse(format!(
            "{} expects (column)",
            expr.func
        )));
    };
    let series = numeric_column(batch, name)?;
    Ok(series.iter().map(|v| v.map(f)).collect())
}

fn rolling(
    batch: &RecordBatch,
    expr: &ParsedExpr,
    f: impl Fn(&[f64]) -> Option<f64>,
) -> Result<Vec<Option<f64>>, FactorError> {
    let (series, window) = column_and_window(batch, expr)?;
    let mut out = Vec::with_capacity(series.len());
    for i in 0..series.len() {
        if i + 1 < window {
            out.push(None);
            continue;
        }
        let slice = &series[i + 1 - window..=i];
        // A null anywhere in the window nulls the output.
        let values: Option<Vec<f64>> = slice.iter().copied().collect();
        out.push(values.and_then(|v| f(&v)));
    }
    Ok(out)
}

fn pct_change(series: &[Option<f64>], lag: usize) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|i| {
            if i < lag {
                return None;
            }
            match (series[i], series[i - lag]) {
                (Some(now), Some(prev)) if prev != 0.0 => Some((now - prev) / prev),
                _ => None,
            }
        })
        .collect()
}

fn shift(series: &[Option<f64>], lag: usize) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|i| if i < lag { None } else { series[i - lag] })
        .collect()
}

fn mean(window: &[f64]) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

/// Sample standard deviation; a one-element window has none.
fn std_dev(window: &[f64]) -> Option<f64> {
    if window.len() < 2 {
        return None;
    }
    let m = mean(window)?;
    let var = window.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (window.len() - 1) as f64;
    Some(var.sqrt())
}

fn append_column(
    batch: &RecordBatch,
    alias: &str,
    values: Vec<Option<f64>>,
) -> Result<RecordBatch, FactorError> {
    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .filter(|f| f.name() != alias)
        .map(|f| f.as_ref().clone())
        .collect();
    let mut columns: Vec<arrow::array::ArrayRef> = batch
        .schema()
        .fields()
        .iter()
        .zip(batch.columns())
        .filter(|(f, _)| f.name() != alias)
        .map(|(_, c)| c.clone())
        .collect();

    fields.push(Field::new(alias, DataType::Float64, true));
    columns.push(Arc::new(Float64Array::from(values)));

    RecordBatch::try_new(Arc::new(arrow::datatypes::Schema::new(fields)), columns)
        .map_err(StoreError::Arrow)
        .map_err(FactorError::from)
}
