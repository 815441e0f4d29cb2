//! Scheduled incremental updates.
//!
//! A task registry maps table name to an update task (fetch function, mode,
//! date range, retry policy). A run resolves each task into the concrete set
//! of missing partition dates, fetches them with bounded concurrency and
//! writes every successful fetch straight back through the partition store,
//! one date at a time, so each partition's ingestion is independently atomic
//! and a re-run picks up exactly where the last one left off.
//!
//! Scheduled tables are partitioned by a single `date` column; the stored
//! partitions double as the ledger of what is already done.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::store::{PartitionStore, StoreError};


pub const DATE_COLUMN: &str = "date";

/// Failure of a single fetch invocation. The scheduler classifies anything a
/// fetch function raises as `Failed`; a fetch that outlives its per-call
/// timeout counts as `TimedOut`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Failed(String),
    #[error("fetch timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(thiserror::Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid update mode '{0}' (expected auto, full or incremental)")]
    InvalidMode(String),
    #[error("Fetch for table '{table}' date {date} failed: {source}")]
    Fetch {
        table: String,
        date: NaiveDate,
        source: FetchError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Capability interface for caller-supplied remote reads. The scheduler
/// depends on this structurally; any closure with the right shape works.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, table: &str, date: NaiveDate) -> Result<RecordBatch, FetchError>;
}

impl<F> Fetcher for F
where
    F: Fn(&str, NaiveDate) -> Result<RecordBatch, FetchError> + Send + Sync,
{
    fn fetch(&self, table: &str, date: NaiveDate) -> Result<RecordBatch, FetchError> {
        self(table, date)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    /// Fill every gap between `beg_date` and the horizon, interior gaps
    /// included. Safe to re-run arbitrarily often.
    Auto,
    /// Recompute the whole `[beg_date, end_date]` range unconditionally.
    Full,
    /// Fetch only dates strictly after the latest stored partition.
    Incremental,
}

impl FromStr for UpdateMode {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(UpdateMode::Auto),
            "full" => Ok(UpdateMode::Full),
            "incremental" => Ok(UpdateMode::Incremental),
            other => Err(ScheduleError::InvalidMode(other.to_string())),
        }
    }
}

/// Where an open-ended `auto`/`incremental` range stops when no `end_date`
/// was given.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GapHorizon {
    /// Extend to the current date.
    Today,
    /// Stop at the latest already-stored partition; nothing beyond it is
    /// fetched. Falls back to today for a table with no partitions yet.
    LatestStored,
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt, per partition date.
    pub max_retries: u32,
    /// Base delay; attempt n waits n times this.
    pub backoff: Duration,
    /// Per-call fetch timeout. None leaves the call unbounded.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(500),
            timeout: None,
        }
    }
}

/// One registered unit of scheduled work. Discarded after the run; the
/// table's stored partitions are the only persistent state.
#[derive(Clone)]
pub struct UpdateTask {
    pub table: String,
    pub fetcher: Arc<dyn Fetcher>,
    pub mode: UpdateMode,
    pub beg_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub retry: RetryPolicy,
}

/// Resolved scheduler settings; loaded elsewhere, consumed here.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub gap_horizon: GapHorizon,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            gap_horizon: GapHorizon::Today,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TableRunReport {
    pub succeeded: Vec<NaiveDate>,
    pub failed: Vec<(NaiveDate, String)>,
}

/// Structured outcome of one `run`: the full success/failure breakdown per
/// table. A non-debug run always completes and always returns this.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub tables: BTreeMap<String, TableRunReport>,
}

impl RunSummary {
    pub fn total_succeeded(&self) -> usize {
        self.tables.values().map(|t| t.succeeded.len()).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.tables.values().map(|t| t.failed.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.total_failed() == 0
    }
}

pub struct Scheduler {
    store: Arc<PartitionStore>,
    config: SchedulerConfig,
    tasks: Mutex<BTreeMap<String, UpdateTask>>,
}

impl Scheduler {
    pub fn new(store: Arc<PartitionStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a task. Re-submitting the same table replaces the prior
    /// registration: last submit wins, never a silent duplicate.
    pub fn submit(&self, task: UpdateTask) {
        let mut tasks = self.tasks.lock();
        if tasks.insert(task.table.clone(), task.clone()).is_some() {
            log::info!("replacing registered update task for '{}'", task.table);
        }
    }

    pub fn submitted_tables(&self) -> Vec<String> {
        self.tasks.lock().keys().cloned().collect()
    }

    /// Executes all registered tasks.
    ///
    /// Normal mode fans candidate dates out over a bounded worker pool,
    /// retries per policy, never aborts on a single partition's failure and
    /// reports the full breakdown. Debug mode runs sequentially without
    /// retries and surfaces the first error immediately.
    pub fn run(&self, debug_mode: bool) -> Result<RunSummary, ScheduleError> {
        let tasks: Vec<UpdateTask> = self.tasks.lock().values().cloned().collect();
        let today = chrono::Local::now().date_naive();

        let mut summary = RunSummary::default();
        let mut work = Vec::new();
        for task in &tasks {
            let candidates = self.resolve_candidates(task, today)?;
            log::info!(
                "table '{}': {} partition(s) to fetch ({:?} mode)",
                task.table,
                candidates.len(),
                task.mode
            );
            summary.tables.entry(task.table.clone()).or_default();
            for date in candidates {
                work.push((task.clone(), date));
            }
        }

        if debug_mode {
            for (task, date) in work {
                log::info!("debug fetch: {} {}", task.table, date);
                let batch =
                    task.fetcher
                        .fetch(&task.table, date)
                        .map_err(|source| ScheduleError::Fetch {
                            table: task.table.clone(),
                            date,
                            source,
                        })?;
                self.store.put(&batch, &task.table, &[DATE_COLUMN])?;
                let report = summary.tables.get_mut(&task.table).unwrap();
                report.succeeded.push(date);
            }
            return Ok(summary);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency.max(1))
            .build()
            .expect("failed to build scheduler thread pool");

        let outcomes: Vec<(String, NaiveDate, Result<(), String>)> = pool.install(|| {
            work.par_iter()
                .map(|(task, date)| {
                    let outcome = self.run_one(task, *date);
                    (task.table.clone(), *date, outcome)
                })
                .collect()
        });

        for (table, date, outcome) in outcomes {
            let report = summary.tables.get_mut(&table).unwrap();
            match outcome {
                Ok(()) => report.succeeded.push(date),
                Err(error) => {
                    log::warn!("table '{}' date {} failed: {}", table, date, error);
                    report.failed.push((date, error));
                }
            }
        }
        for report in summary.tables.values_mut() {
            report.succeeded.sort();
            report.failed.sort_by_key(|(d, _)| *d);
        }
        log::info!(
            "update run finished: {} succeeded, {} failed",
            summary.total_succeeded(),
            summary.total_failed()
        );
        Ok(summary)
    }

    /// Fetches and writes a single partition date, with bounded retries.
    fn run_one(&self, task: &UpdateTask, date: NaiveDate) -> Result<(), String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match fetch_bounded(&task.fetcher, &task.table, date, task.retry.timeout) {
                Ok(batch) => {
                    // Written immediately, scoped to this one key: ingestion
                    // of each partition is independently atomic.
                    return self
                        .store
                        .put(&batch, &task.table, &[DATE_COLUMN])
                        .map_err(|e| e.to_string());
                }
                Err(err) if attempt <= task.retry.max_retries => {
                    log::warn!(
                        "table '{}' date {} attempt {} failed, retrying: {}",
                        task.table,
                        date,
                        attempt,
                        err
                    );
                    std::thread::sleep(task.retry.backoff * attempt);
                }
                Err(err) => return Err(err.to_string()),
            }
        }
    }

    /// Resolves a task into the concrete list of pending partition dates,
    /// consulting the stored-partition ledger.
    fn resolve_candidates(
        &self,
        task: &UpdateTask,
        today: NaiveDate,
    ) -> Result<Vec<NaiveDate>, ScheduleError> {
        let stored = self.stored_dates(&task.table)?;
        let latest = stored.iter().next_back().copied();

        let horizon = match task.end_date {
            Some(end) => end,
            None => match self.config.gap_horizon {
                GapHorizon::Today => today,
                GapHorizon::LatestStored => latest.unwrap_or(today),
            },
        };

        let candidates = match task.mode {
            UpdateMode::Full => date_range(task.beg_date, horizon),
            UpdateMode::Auto => date_range(task.beg_date, horizon)
                .into_iter()
                .filter(|d| !stored.contains(d))
                .collect(),
            UpdateMode::Incremental => match latest {
                Some(latest) => date_range(latest.succ_opt().unwrap_or(latest), horizon),
                // Nothing stored yet: behave like a full backfill.
                None => date_range(task.beg_date, horizon),
            },
        };
        Ok(candidates)
    }

    fn stored_dates(&self, table: &str) -> Result<std::collections::BTreeSet<NaiveDate>, ScheduleError> {
        if !self.store.exists(table) {
            return Ok(Default::default());
        }
        let mut dates = std::collections::BTreeSet::new();
        for key in self.store.list_partitions(table)? {
            if let Some(rendered) = key.strip_prefix(&format!("{}=", DATE_COLUMN)) {
                if let Ok(date) = NaiveDate::parse_from_str(rendered, "%Y-%m-%d") {
                    dates.insert(date);
                }
            }
        }
        Ok(dates)
    }
}

fn date_range(beg: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = beg;
    while current <= end {
        dates.push(current);
        match current.succ_opt() {
            Some(next) => current = next,
            None => break,
        }
    }
    dates
}

/// Runs the fetch on a helper thread when a timeout is configured, so a hung
/// remote call counts as a failure instead of stalling the worker. The
/// helper thread is left to finish in the background.
fn fetch_bounded(
    fetcher: &Arc<dyn Fetcher>,
    table: &str,
    date: NaiveDate,
    timeout: Option<Duration>,
) -> Result<RecordBatch, FetchError> {
    let Some(timeout) = timeout else {
        return fetcher.fetch(table, date);
    };
    let (tx, rx) = mpsc::channel();
    let fetcher = fetcher.clone();
    let table = table.to_string();
    std::thread::spawn(move || {
        let _ = tx.send(fetcher.fetch(&table, date));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(FetchError::TimedOut(timeout)),
    }
}
