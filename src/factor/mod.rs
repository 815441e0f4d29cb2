//! Composable factor computation over stored tables.
//!
//! A factor is a named, parametrized computation whose output is persisted
//! like any other table (under `factors/<name>`), so queries and other
//! factors read it back through the same partition store. Factors declare
//! their inputs; the engine orders the dependency subgraph topologically,
//! computes anything not yet materialized for the requested date and reuses
//! cached partitions otherwise.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arrow::array::Date32Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parking_lot::RwLock;

use crate::query::{Database, QueryError};
use crate::store::{date_to_days, CmpOp, Predicate, StoreError};

mod expr;

#[cfg(test)]
mod tests;

pub use expr::{apply_exprs, parse_expr, ExprArg, ParsedExpr};

pub const FACTOR_TABLE_PREFIX: &str = "factors";
const DATE_COLUMN: &str = "date";

#[derive(thiserror::Error, Debug)]
pub enum FactorError {
    #[error("Unknown factor: {0}")]
    UnknownFactor(String),
    #[error("Cyclic factor dependency involving '{0}'")]
    CyclicDependency(String),
    #[error("Unknown expression function: {0}")]
    UnknownExpressionFunction(String),
    #[error("Undefined alias or column: {0}")]
    UndefinedAlias(String),
    #[error("Expression parse error: {0}")]
    ExprParse(String),
    #[error("Factor '{name}' failed: {reason}")]
    Computation { name: String, reason: String },
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Intraday,
}

/// Extra keyword-style arguments for one computation, e.g. an intraday
/// cutoff time. Ordered so the same args always render the same cache key.
pub type FactorArgs = BTreeMap<String, String>;

/// What a factor function sees: the date under computation, the extra args,
/// and read access to stored tables and previously computed factors.
pub struct FactorCtx<'a> {
    pub date: NaiveDate,
    pub args: &'a FactorArgs,
    pub db: &'a Database,
}

pub type FactorFn =
    Arc<dyn Fn(&FactorCtx<'_>) -> Result<RecordBatch, FactorError> + Send + Sync>;

/// A named computation plus its declared inputs. Dependencies name other
/// factors or raw tables; only names registered as factors participate in
/// dependency ordering, anything else is assumed to be a stored table.
#[derive(Clone)]
pub struct Factor {
    pub name: String,
    pub deps: Vec<String>,
    pub frequency: Frequency,
    func: FactorFn,
}

impl Factor {
    pub fn new(
        name: impl Into<String>,
        deps: Vec<String>,
        frequency: Frequency,
        func: FactorFn,
    ) -> Self {
        Self {
            name: name.into(),
            deps,
            frequency,
            func,
        }
    }

    /// Conventional output table name.
    pub fn output_table(&self) -> String {
        format!("{}/{}", FACTOR_TABLE_PREFIX, self.name)
    }
}

pub struct FactorEngine {
    db: Database,
    registry: RwLock<HashMap<String, Arc<Factor>>>,
}

impl FactorEngine {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a factor. A dependency closure that reaches back to the
    /// factor itself is rejected here, eagerly, rather than at first
    /// evaluation.
    pub fn register(&self, factor: Factor) -> Result<(), FactorError> {
        let mut registry = self.registry.write();
        let name = factor.name.clone();
        let previous = registry.insert(name.clone(), Arc::new(factor));
        if let Err(e) = check_acyclic(&registry, &name) {
            // Roll back so a bad registration leaves the engine untouched.
            match previous {
                Some(prev) => registry.insert(name, prev),
                None => registry.remove(&name),
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Factor>> {
        self.registry.read().get(name).cloned()
    }

    /// Computes a factor for one date, materializing any missing
    /// dependencies first, and returns the factor's output for that date.
    /// Already-stored outputs are reused unless `force` is set.
    pub fn compute(
        &self,
        name: &str,
        date: NaiveDate,
        args: &FactorArgs,
        force: bool,
    ) -> Result<RecordBatch, FactorError> {
        let order = self.evaluation_order(name)?;
        for factor in &order {
            let table = cache_table(factor, args);
            let recompute = force && factor.name == name;
            if !recompute && self.is_materialized(&table, date)? {
                log::debug!("factor '{}' {} served from cache", factor.name, date);
                continue;
            }
            let ctx = FactorCtx {
                date,
                args,
                db: &self.db,
            };
            let batch = (factor.func)(&ctx)?;
            let batch = ensure_date_column(&batch, date)?;
            self.db.store().put(&batch, &table, &[DATE_COLUMN])?;
            log::info!("computed factor '{}' for {}", factor.name, date);
        }

        let target = order.last().expect("evaluation order never empty");
        let rendered = date.format("%Y-%m-%d").to_string();
        Ok(self.db.store().read(
            &cache_table(target, args),
            &Predicate::all().key(DATE_COLUMN, CmpOp::Eq, rendered),
        )?)
    }

    /// Dependency-first order of the registered factors feeding `name`,
    /// ending with `name` itself.
    fn evaluation_order(&self, name: &str) -> Result<Vec<Arc<Factor>>, FactorError> {
        let registry = self.registry.read();
        if !registry.contains_key(name) {
            return Err(FactorError::UnknownFactor(name.to_string()));
        }
        let mut order = Vec::new();
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        visit(&registry, name, &mut visiting, &mut done, &mut order)?;
        Ok(order)
    }

    fn is_materialized(&self, table: &str, date: NaiveDate) -> Result<bool, FactorError> {
        if !self.db.store().exists(table) {
            return Ok(false);
        }
        let key = format!("{}={}", DATE_COLUMN, date.format("%Y-%m-%d"));
        Ok(self.db.store().list_partitions(table)?.contains(&key))
    }
}

/// Output table for one (factor, args) combination. Extra args extend the
/// path so differently parametrized runs cache independently.
fn cache_table(factor: &Factor, args: &FactorArgs) -> String {
    if args.is_empty() {
        factor.output_table()
    } else {
        let suffix = args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}/{}", factor.output_table(), suffix)
    }
}

fn check_acyclic(
    registry: &HashMap<String, Arc<Factor>>,
    start: &str,
) -> Result<(), FactorError> {
    let mut order = Vec::new();
    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    visit(registry, start, &mut visiting, &mut done, &mut order)?;
    Ok(())
}

/// Depth-first post-order walk over registered factors. Unregistered
/// dependency names are raw tables and terminate the walk.
fn visit(
    registry: &HashMap<String, Arc<Factor>>,
    name: &str,
    visiting: &mut HashSet<String>,
    done: &mut HashSet<String>,
    order: &mut Vec<Arc<Factor>>,
) -> Result<(), FactorError> {
    let Some(factor) = registry.get(name) else {
        return Ok(());
    };
    if done.contains(name) {
        return Ok(());
    }
    if !visiting.insert(name.to_string()) {
        return Err(FactorError::CyclicDependency(name.to_string()));
    }
    for dep in &factor.deps {
        visit(registry, dep, visiting, done, order)?;
    }
    visiting.remove(name);
    done.insert(name.to_string());
    order.push(factor.clone());
    Ok(())
}

/// Factor functions may return a dataset without the date column; the engine
/// stamps it on before persisting so the output partitions like any other
/// date-keyed table.
fn ensure_date_column(batch: &RecordBatch, date: NaiveDate) -> Result<RecordBatch, FactorError> {
    if batch.column_by_name(DATE_COLUMN).is_some() {
        return Ok(batch.clone());
    }
    let days = date_to_days(date);
    let date_array = Date32Array::from(vec![days; batch.num_rows()]);

    let mut fields = vec![Field::new(DATE_COLUMN, DataType::Date32, false)];
    fields.extend(batch.schema().fields().iter().map(|f| f.as_ref().clone()));
    let mut columns: Vec<arrow::array::ArrayRef> = vec![Arc::new(date_array)];
    columns.extend(batch.columns().iter().cloned());

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(StoreError::Arrow)
        .map_err(FactorError::from)
}
