//! Restricted SQL over stored tables.
//!
//! Supported shape: `SELECT <cols|*> FROM <table> [WHERE <conjuncts>]
//! [ORDER BY col [ASC|DESC], ...] [LIMIT n]`. The WHERE clause is split into
//! the sub-predicate on partition columns, which prunes directories before
//! any file is opened, and residual row filters applied in memory. Table
//! names are hierarchical paths, so quote them: `FROM "market_data/kline_daily"`.
//!
//! Factor output tables live in the same namespace and need no special
//! handling here.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_ord::sort::{lexsort_to_indices, SortColumn, SortOptions};
use sqlparser::ast::{
    BinaryOperator, Expr, LimitClause, ObjectNamePart, OrderByExpr, OrderByKind, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::store::{
    date_to_days, CmpOp, ColumnType, PartitionStore, Predicate, ScalarValue, StoreError,
    TableSchema,
};

#[cfg(test)]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Unsupported construct: {0}")]
    Unsupported(String),
    #[error("Unknown column: {0}")]
    UnknownColumn(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// SQL entry point over a partition store. Stateless beyond the store handle;
/// cheap to clone.
#[derive(Clone)]
pub struct Database {
    store: Arc<PartitionStore>,
}

struct ParsedQuery {
    table: String,
    projection: Option<Vec<String>>,
    predicate: Predicate,
    order_by: Vec<(String, SortOptions)>,
    limit: Option<usize>,
}

impl Database {
    pub fn new(store: Arc<PartitionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PartitionStore> {
        &self.store
    }

    pub fn sql(&self, query_text: &str) -> Result<RecordBatch, QueryError> {
        let dialect = GenericDialect {};
        let ast = Parser::parse_sql(&dialect, query_text)
            .map_err(|e| QueryError::Parse(e.to_string()))?;
        if ast.len() != 1 {
            return Err(QueryError::Unsupported(
                "only single-statement queries supported".into(),
            ));
        }
        let query = match &ast[0] {
            Statement::Query(query) => query,
            other => {
                return Err(QueryError::Unsupported(format!(
                    "only SELECT is supported, got {}",
                    statement_kind(other)
                )))
            }
        };
        let parsed = self.lower_query(query)?;

        let batch = self.store.read(&parsed.table, &parsed.predicate)?;
        let batch = apply_order_by(&batch, &parsed.order_by)?;
        let batch = match parsed.limit {
            Some(n) if n < batch.num_rows() => batch.slice(0, n),
            _ => batch,
        };
        match &parsed.projection {
            Some(columns) => project(&batch, columns),
            None => Ok(batch),
        }
    }

    fn lower_query(&self, query: &Query) -> Result<ParsedQuery, QueryError> {
        if query.with.is_some() {
            return Err(QueryError::Unsupported("WITH clauses".into()));
        }
        let select = match &*query.body {
            SetExpr::Select(select) => select,
            _ => {
                return Err(QueryError::Unsupported(
                    "set operations and nested queries".into(),
                ))
            }
        };
        let table = extract_table_name(select)?;
        let schema = self.store.schema(&table)?;
        let partition_columns = self.store.partition_columns(&table)?;

        let mut predicate = Predicate::all();
        if let Some(where_clause) = &select.selection {
            let mut conjuncts = Vec::new();
            split_conjuncts(where_clause, &mut conjuncts);
            for conjunct in conjuncts {
                lower_conjunct(conjunct, &schema, &partition_columns, &mut predicate)?;
            }
        }

        Ok(ParsedQuery {
            projection: extract_projection(select, &schema)?,
            predicate,
            order_by: extract_order_by(query, &schema)?,
            limit: extract_limit(query)?,
            table,
        })
    }
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::Drop { .. } => "DROP",
        _ => "a non-SELECT statement",
    }
}

fn extract_table_name(select: &Select) -> Result<String, QueryError> {
    if select.from.len() != 1 {
        return Err(QueryError::Unsupported(
            "exactly one table in FROM is required".into(),
        ));
    }
    let from = &select.from[0];
    if !from.joins.is_empty() {
        return Err(QueryError::Unsupported("joins".into()));
    }
    match &from.relation {
        TableFactor::Table { name, .. } => {
            let parts: Vec<String> = name
                .0
                .iter()
                .map(|part| match part {
                    ObjectNamePart::Identifier(ident) => Ok(ident.value.clone()),
                    _ => Err(QueryError::Unsupported("table functions".into())),
                })
                .collect::<Result<_, _>>()?;
            Ok(parts.join("."))
        }
        TableFactor::Derived { .. } => Err(QueryError::Unsupported("subqueries in FROM".into())),
        _ => Err(QueryError::Unsupported("non-table FROM items".into())),
    }
}

fn extract_projection(
    select: &Select,
    schema: &TableSchema,
) -> Result<Option<Vec<String>>, QueryError> {
    if select.distinct.is_some() {
        return Err(QueryError::Unsupported("DISTINCT".into()));
    }
    if !group_by_is_empty(select) {
        return Err(QueryError::Unsupported("GROUP BY".into()));
    }
    let mut columns = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                if schema.column(&ident.value).is_none() {
                    return Err(QueryError::UnknownColumn(ident.value.clone()));
                }
                columns.push(ident.value.clone());
            }
            SelectItem::Wildcard(_) => {
                if select.projection.len() > 1 {
                    return Err(QueryError::Parse(
                        "mixing named columns and * is unsupported".into(),
                    ));
                }
                return Ok(None);
            }
            SelectItem::UnnamedExpr(Expr::Function(_)) => {
                return Err(QueryError::Unsupported(
                    "aggregate functions (use the factor expression API for derived columns)"
                        .into(),
                ))
            }
            _ => return Err(QueryError::Unsupported("unsupported select item".into())),
        }
    }
    Ok(Some(columns))
}

fn group_by_is_empty(select: &Select) -> bool {
    match &select.group_by {
        sqlparser::ast::GroupByExpr::Expressions(exprs, _) => exprs.is_empty(),
        sqlparser::ast::GroupByExpr::All(_) => false,
    }
}

/// Flattens a WHERE tree into its AND-ed conjuncts.
fn split_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            split_conjuncts(left, out);
            split_conjuncts(right, out);
        }
        Expr::Nested(inner) => split_conjuncts(inner, out),
        other => out.push(other),
    }
}

/// Routes one conjunct: comparisons on partition columns become pruning
/// constraints, everything else becomes an in-memory row filter.
fn lower_conjunct(
    expr: &Expr,
    schema: &TableSchema,
    partition_columns: &[String],
    predicate: &mut Predicate,
) -> Result<(), QueryError> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return Err(QueryError::Unsupported(format!(
            "WHERE must be a conjunction of comparisons, got {}",
            expr
        )));
    };
    let cmp = match op {
        BinaryOperator::Eq => CmpOp::Eq,
        BinaryOperator::NotEq => CmpOp::NotEq,
        BinaryOperator::Lt => CmpOp::Lt,
        BinaryOperator::LtEq => CmpOp::LtEq,
        BinaryOperator::Gt => CmpOp::Gt,
        BinaryOperator::GtEq => CmpOp::GtEq,
        BinaryOperator::Or => {
            return Err(QueryError::Unsupported(
                "OR in WHERE (the dialect supports conjunctions only)".into(),
            ))
        }
        other => {
            return Err(QueryError::Unsupported(format!(
                "operator {} in WHERE",
                other
            )))
        }
    };

    // Accept both `col <op> literal` and `literal <op> col`.
    let (column, value, cmp) = match (left.as_ref(), right.as_ref()) {
        (Expr::Identifier(ident), Expr::Value(value)) => (&ident.value, &value.value, cmp),
        (Expr::Value(value), Expr::Identifier(ident)) => (&ident.value, &value.value, flip(cmp)),
        _ => {
            return Err(QueryError::Unsupported(
                "comparisons must be between a column and a literal".into(),
            ))
        }
    };

    let column_def = schema
        .column(column)
        .ok_or_else(|| QueryError::UnknownColumn(column.clone()))?;
    let scalar = literal_to_scalar(value, column_def.dtype)?;

    // Partition-key conjuncts prune directories; equality and ranges only.
    // NotEq cannot prune safely, so it stays a row filter.
    if partition_columns.contains(column) && cmp != CmpOp::NotEq {
        predicate.keys.push(crate::store::KeyConstraint {
            column: column.clone(),
            op: cmp,
            value: scalar.render(),
        });
    }
    predicate.filters.push(crate::store::ColumnFilter {
        column: column.clone(),
        op: cmp,
        value: scalar,
    });
    Ok(())
}

fn flip(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Lt => CmpOp::Gt,
        CmpOp::LtEq => CmpOp::GtEq,
        CmpOp::Gt => CmpOp::Lt,
        CmpOp::GtEq => CmpOp::LtEq,
        other => other,
    }
}

/// Converts a SQL literal to a scalar in the column's semantic type.
fn literal_to_scalar(value: &Value, dtype: ColumnType) -> Result<ScalarValue, QueryError> {
    match (dtype, value) {
        (ColumnType::Int, Value::Number(n, _)) => n
            .parse::<i64>()
            .map(ScalarValue::Int64)
            .map_err(|_| QueryError::Parse(format!("invalid integer literal {}", n))),
        (ColumnType::Float, Value::Number(n, _)) => n
            .parse::<f64>()
            .map(ScalarValue::Float64)
            .map_err(|_| QueryError::Parse(format!("invalid float literal {}", n))),
        (ColumnType::Timestamp, Value::Number(n, _)) => n
            .parse::<i64>()
            .map(ScalarValue::TimestampNanosecond)
            .map_err(|_| QueryError::Parse(format!("invalid timestamp literal {}", n))),
        (ColumnType::Date, Value::SingleQuotedString(s)) => {
            let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| QueryError::Parse(format!("invalid date literal '{}'", s)))?;
            Ok(ScalarValue::Date32(date_to_days(date)))
        }
        (ColumnType::Str, Value::SingleQuotedString(s)) => Ok(ScalarValue::Utf8(s.clone())),
        (ColumnType::Bool, Value::Boolean(b)) => Ok(ScalarValue::Boolean(*b)),
        (_, Value::Null) => Ok(ScalarValue::Null),
        (dtype, other) => Err(QueryError::Parse(format!(
            "literal {} does not fit {} column",
            other, dtype
        ))),
    }
}

fn extract_order_by(
    query: &Query,
    schema: &TableSchema,
) -> Result<Vec<(String, SortOptions)>, QueryError> {
    let Some(order_by) = &query.order_by else {
        return Ok(Vec::new());
    };
    let exprs: &[OrderByExpr] = match &order_by.kind {
        OrderByKind::Expressions(exprs) => exprs,
        OrderByKind::All(_) => return Err(QueryError::Unsupported("ORDER BY ALL".into())),
    };
    let mut keys = Vec::with_capacity(exprs.len());
    for item in exprs {
        let Expr::Identifier(ident) = &item.expr else {
            return Err(QueryError::Unsupported(
                "ORDER BY supports plain columns only".into(),
            ));
        };
        if schema.column(&ident.value).is_none() {
            return Err(QueryError::UnknownColumn(ident.value.clone()));
        }
        let options = SortOptions {
            descending: item.options.asc == Some(false),
            nulls_first: item.options.nulls_first.unwrap_or(false),
        };
        keys.push((ident.value.clone(), options));
    }
    Ok(keys)
}

fn extract_limit(query: &Query) -> Result<Option<usize>, QueryError> {
    let Some(limit_clause) = &query.limit_clause else {
        return Ok(None);
    };
    let limit_expr = match limit_clause {
        LimitClause::LimitOffset {
            limit,
            offset: None,
            limit_by,
        } if limit_by.is_empty() => limit,
        _ => return Err(QueryError::Unsupported("OFFSET / LIMIT BY".into())),
    };
    match limit_expr {
        None => Ok(None),
        Some(Expr::Value(value)) => match &value.value {
            Value::Number(n, _) => n
                .parse::<usize>()
                .map(Some)
                .map_err(|_| QueryError::Parse(format!("invalid LIMIT {}", n))),
            other => Err(QueryError::Parse(format!("invalid LIMIT {}", other))),
        },
        Some(other) => Err(QueryError::Unsupported(format!(
            "LIMIT expression {}",
            other
        ))),
    }
}

fn apply_order_by(
    batch: &RecordBatch,
    keys: &[(String, SortOptions)],
) -> Result<RecordBatch, QueryError> {
    if keys.is_empty() || batch.num_rows() == 0 {
        return Ok(batch.clone());
    }
    let sort_columns: Vec<SortColumn> = keys
        .iter()
        .map(|(column, options)| {
            let values = batch
                .column_by_name(column)
                .ok_or_else(|| QueryError::UnknownColumn(column.clone()))?;
            Ok(SortColumn {
                values: values.clone(),
                options: Some(*options),
            })
        })
        .collect::<Result<_, QueryError>>()?;
    let indices = lexsort_to_indices(&sort_columns, None).map_err(StoreError::Arrow)?;
    let columns = batch
        .columns()
        .iter()
        .map(|col| arrow::compute::take(col.as_ref(), &indices, None))
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::Arrow)?;
    Ok(RecordBatch::try_new(batch.schema(), columns).map_err(StoreError::Arrow)?)
}

fn project(batch: &RecordBatch, columns: &[String]) -> Result<RecordBatch, QueryError> {
    let schema = batch.schema();
    let indices: Vec<usize> = columns
        .iter()
        .map(|col| {
            schema
                .index_of(col)
                .map_err(|_| QueryError::UnknownColumn(col.clone()))
        })
        .collect::<Result<_, _>>()?;
    Ok(batch.project(&indices).map_err(StoreError::Arrow)?)
}
