use arrow::array::BooleanArray;
use arrow::compute::kernels::cmp;
use arrow::record_batch::RecordBatch;

use super::partition::PartitionKey;
use super::scalar::ScalarValue;
use super::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl std::fmt::Display for CmpOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
        };
        f.write_str(s)
    }
}

/// A constraint on a partition column, evaluated against rendered key values
/// for directory pruning. Only the pre-load pruning path uses these; the
/// same condition is not re-applied per row since a partition holds exactly
/// one value of each partition column.
#[derive(Clone, Debug)]
pub struct KeyConstraint {
    pub column: String,
    pub op: CmpOp,
    pub value: String,
}

impl KeyConstraint {
    pub fn matches(&self, key: &PartitionKey) -> bool {
        let Some(actual) = key.value(&self.column) else {
            // Unknown partition column never prunes anything.
            return true;
        };
        let ord = compare_rendered(actual, &self.value);
        match self.op {
            CmpOp::Eq => ord == std::cmp::Ordering::Equal,
            CmpOp::NotEq => ord != std::cmp::Ordering::Equal,
            CmpOp::Lt => ord == std::cmp::Ordering::Less,
            CmpOp::LtEq => ord != std::cmp::Ordering::Greater,
            CmpOp::Gt => ord == std::cmp::Ordering::Greater,
            CmpOp::GtEq => ord != std::cmp::Ordering::Less,
        }
    }
}

/// Rendered key values compare numerically when both sides parse as numbers,
/// otherwise lexicographically. ISO dates sort correctly either way.
fn compare_rendered(a: &str, b: &str) -> std::cmp::Ordering {
    if let (Ok(x), Ok(y)) = (a.parse::<i64>(), b.parse::<i64>()) {
        return x.cmp(&y);
    }
    if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
        return x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal);
    }
    a.cmp(b)
}

/// A row-level comparison filter applied after partitions are loaded.
#[derive(Clone, Debug)]
pub struct ColumnFilter {
    pub column: String,
    pub op: CmpOp,
    pub value: ScalarValue,
}

impl ColumnFilter {
    pub fn apply(&self, batch: &RecordBatch) -> Result<BooleanArray, StoreError> {
        let col = batch.column_by_name(&self.column).ok_or_else(|| {
            StoreError::InvalidPartition(format!("filter references unknown column '{}'", self.column))
        })?;
        let comparator = match self.op {
            CmpOp::Eq => cmp::eq,
            CmpOp::NotEq => cmp::neq,
            CmpOp::Lt => cmp::lt,
            CmpOp::LtEq => cmp::lt_eq,
            CmpOp::Gt => cmp::gt,
            CmpOp::GtEq => cmp::gt_eq,
        };
        Ok(comparator(col, &self.value.to_array(col.len()))?)
    }
}

/// A conjunction of partition-key constraints and row filters. The key part
/// selects which partition directories are loaded at all; the filters run
/// against the loaded batches.
#[derive(Clone, Debug, Default)]
pub struct Predicate {
    pub keys: Vec<KeyConstraint>,
    pub filters: Vec<ColumnFilter>,
}

impl Predicate {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(mut self, column: &str, op: CmpOp, value: impl Into<String>) -> Self {
        self.keys.push(KeyConstraint {
            column: column.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn filter(mut self, column: &str, op: CmpOp, value: ScalarValue) -> Self {
        self.filters.push(ColumnFilter {
            column: column.to_string(),
            op,
            value,
        });
        self
    }

    pub fn matches_key(&self, key: &PartitionKey) -> bool {
        self.keys.iter().all(|c| c.matches(key))
    }

    /// Combined row mask for the filter conjuncts, or None when there are no
    /// row-level filters.
    pub fn row_mask(&self, batch: &RecordBatch) -> Result<Option<BooleanArray>, StoreError> {
        let mut mask: Option<BooleanArray> = None;
        for filter in &self.filters {
            let next = filter.apply(batch)?;
            mask = Some(match mask {
                Some(prev) => arrow::compute::and(&prev, &next)?,
                None => next,
            });
        }
        Ok(mask)
    }
}
