use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, warn};

use crate::data_model::{FailureKind, FetchResult, InputRow, RowOutcome};
use crate::error::{FetchError, Result};
use crate::pipeline::fetcher::Fetcher;
use crate::pipeline::sources::Source;
use crate::utils::prometheus_metrics::*;

/// Runs batches of rows on a bounded worker pool and trips a breaker after too many
/// consecutive fatal failures.
pub struct BatchExecutor {
    pool: ThreadPool,
    fetcher: Fetcher,
    max_consecutive_fatal: usize,
    consecutive_fatal: AtomicUsize,
    aborted: AtomicBool,
    last_fatal: Mutex<Option<String>>,
}

impl BatchExecutor {
    pub fn new(fetcher: Fetcher, pool_size: usize, max_consecutive_fatal: usize) -> Result<Self> {
        if pool_size == 0 {
            return Err(FetchError::invalid("pool_size", "must be greater than 0"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("fetch-worker-{}", i))
            .build()
            .map_err(|e| FetchError::Unexpected(format!("Failed to build worker pool: {}", e)))?;
        Ok(BatchExecutor {
            pool,
            fetcher,
            max_consecutive_fatal: max_consecutive_fatal.max(1),
            consecutive_fatal: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            last_fatal: Mutex::new(None),
        })
    }

    /// One outcome per row, in input order regardless of completion order.
    pub fn run_batch(&self, source: &dyn Source, batch: &[InputRow]) -> Vec<RowOutcome> {
        self.pool.install(|| {
            batch
                .par_iter()
                .map(|row| self.run_row(source, row))
                .collect()
        })
    }

    pub fn run_row(&self, source: &dyn Source, row: &InputRow) -> RowOutcome {
        if self.is_aborted() {
            ROWS_SKIPPED_TOTAL.inc();
            return RowOutcome::Skipped {
                input_id: row.id.clone(),
            };
        }

        let outcome = match self.fetcher.fetch_row(source, row) {
            Ok(FetchResult::Success(payload)) => {
                ROWS_FETCHED_TOTAL.inc();
                RowOutcome::Fetched {
                    input_id: row.id.clone(),
                    payload,
                }
            }
            Ok(FetchResult::NotFound) => {
                ROWS_NOT_FOUND_TOTAL.inc();
                debug!(source = source.name(), input_id = %row.id, "No result at any granularity");
                RowOutcome::NotFound {
                    input_id: row.id.clone(),
                    sentinel: source.sentinel(row),
                }
            }
            Ok(FetchResult::TransientError(reason)) => {
                ROWS_FAILED_TOTAL.inc();
                warn!(source = source.name(), input_id = %row.id, %reason, "Retries exhausted");
                RowOutcome::Failed {
                    input_id: row.id.clone(),
                    reason,
                    kind: FailureKind::Transient,
                }
            }
            Ok(FetchResult::FatalError(reason)) => {
                ROWS_FAILED_TOTAL.inc();
                error!(source = source.name(), input_id = %row.id, %reason, "Fatal fetch error");
                RowOutcome::Failed {
                    input_id: row.id.clone(),
                    reason,
                    kind: FailureKind::Fatal,
                }
            }
            Err(e) => {
                ROWS_FAILED_TOTAL.inc();
                warn!(source = source.name(), input_id = %row.id, error = %e, "Invalid input row");
                RowOutcome::Failed {
                    input_id: row.id.clone(),
                    reason: e.to_string(),
                    kind: FailureKind::InvalidInput,
                }
            }
        };
        self.track(&outcome);
        outcome
    }

    fn track(&self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Failed {
                reason,
                kind: FailureKind::Fatal,
                ..
            } => {
                let count = self.consecutive_fatal.fetch_add(1, Ordering::SeqCst) + 1;
                if let Ok(mut last) = self.last_fatal.lock() {
                    *last = Some(reason.clone());
                }
                if count >= self.max_consecutive_fatal && !self.aborted.swap(true, Ordering::SeqCst)
                {
                    error!(
                        consecutive = count,
                        "Too many consecutive fatal errors, aborting run"
                    );
                }
            }
            // Bad rows say nothing about the API's health.
            RowOutcome::Failed {
                kind: FailureKind::InvalidInput,
                ..
            }
            | RowOutcome::Skipped { .. } => {}
            _ => self.consecutive_fatal.store(0, Ordering::SeqCst),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// The abort error, once the breaker has tripped.
    pub fn abort_error(&self) -> Option<FetchError> {
        if !self.is_aborted() {
            return None;
        }
        let last_reason = self
            .last_fatal
            .lock()
            .ok()
            .and_then(|last| last.clone())
            .unwrap_or_default();
        Some(FetchError::Aborted {
            consecutive: self
                .consecutive_fatal
                .load(Ordering::SeqCst)
                .max(self.max_consecutive_fatal),
            last_reason,
        })
    }
}
