// src/runner.rs

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use indicatif::HumanDuration;
use tracing::{info, warn};

use crate::config::JobConfig;
use crate::data_model::{InputRow, RowOutcome};
use crate::error::{FetchError, Result};
use crate::executor::BatchExecutor;
use crate::pipeline::accumulator::Checkpointer;
use crate::pipeline::batcher::{group_superbatches, plan_batches};
use crate::pipeline::fanout::{plan_invocations, write_fanout, TaskDescriptor};
use crate::pipeline::fetcher::{Fetcher, HttpTransport, Transport};
use crate::pipeline::readers::read_all;
use crate::pipeline::sources::{build_source, Source};
use crate::utils::create_progress_bar;

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] {msg} {pos}/{len} ({percent}%) ({per_sec}, ETA: {eta})";

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub inputs_total: usize,
    pub inputs_already_resolved: usize,
    pub inputs_rejected: usize,
    pub fetched: usize,
    pub not_found: usize,
    pub failed: usize,
    pub skipped: usize,
    pub superbatches_run: usize,
    /// True when the run stopped at `max_superbatches` with work left over.
    pub stopped_early: bool,
    pub output_rows: usize,
    pub failed_inputs_total: usize,
}

impl RunSummary {
    fn count(&mut self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Fetched { .. } => self.fetched += 1,
            RowOutcome::NotFound { .. } => self.not_found += 1,
            RowOutcome::Failed { .. } => self.failed += 1,
            RowOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Drives one job: inputs, resume filter, batching, execution and checkpointing.
pub struct JobRunner {
    config: JobConfig,
    source: Box<dyn Source>,
    transport: Arc<dyn Transport>,
}

impl JobRunner {
    pub fn new(config: JobConfig, source: Box<dyn Source>, transport: Arc<dyn Transport>) -> Self {
        JobRunner {
            config,
            source,
            transport,
        }
    }

    /// Builds the configured source and a real HTTP transport.
    pub fn from_config(config: JobConfig) -> Result<Self> {
        let source = build_source(&config.source)?;
        let transport = Arc::new(HttpTransport::new(&config.http)?);
        Ok(JobRunner::new(config, source, transport))
    }

    pub fn source(&self) -> &dyn Source {
        self.source.as_ref()
    }

    /// Generated or read inputs, with ids assigned, rejected rows dropped and
    /// duplicate ids collapsed onto their first occurrence.
    pub fn load_inputs(&self) -> Result<(Vec<InputRow>, usize)> {
        let rows = match self.source.generate_inputs() {
            Some(rows) => rows,
            None => {
                let input = self.config.input.as_ref().ok_or_else(|| {
                    FetchError::ConfigValidationError(format!(
                        "{} jobs need an `input` section",
                        self.source.name()
                    ))
                })?;
                let mut rows = read_all(input)?;
                if input.id_column.is_none() {
                    for row in rows.iter_mut() {
                        if let Some(id) = self.source.derive_id(row) {
                            row.id = id;
                        }
                    }
                }
                rows
            }
        };

        let total = rows.len();
        let mut seen = HashSet::with_capacity(total);
        let mut duplicates = 0usize;
        let mut accepted = Vec::with_capacity(total);
        for row in rows {
            if !self.source.accepts(&row) {
                continue;
            }
            if !seen.insert(row.id.clone()) {
                duplicates += 1;
                continue;
            }
            accepted.push(row);
        }
        if duplicates > 0 {
            warn!(
                duplicates,
                "Input contains repeated ids; each is fetched once"
            );
        }
        let rejected = total - accepted.len() - duplicates;
        if rejected > 0 {
            info!(rejected, "Input rows not eligible for this source");
        }
        Ok((accepted, rejected))
    }

    /// Fetches every unresolved input, flushing after each superbatch.
    pub fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let batching = &self.config.batching;
        let (inputs, rejected) = self.load_inputs()?;

        let mut checkpointer =
            Checkpointer::open(self.source.as_ref(), &self.config.output, batching.resume)?;
        let mut summary = RunSummary {
            inputs_total: inputs.len(),
            inputs_rejected: rejected,
            ..RunSummary::default()
        };

        let pending: Vec<InputRow> = inputs
            .into_iter()
            .filter(|row| !checkpointer.is_resolved(&row.id))
            .collect();
        summary.inputs_already_resolved = summary.inputs_total - pending.len();
        info!(
            source = self.source.name(),
            total = summary.inputs_total,
            already_resolved = summary.inputs_already_resolved,
            pending = pending.len(),
            "Starting fetch run"
        );

        let pending_count = pending.len() as u64;
        let superbatches = group_superbatches(
            plan_batches(pending, batching)?,
            batching.superbatch_size,
        )?;
        let executor = BatchExecutor::new(
            Fetcher::new(self.transport.clone(), self.config.retry.clone()),
            batching.pool_size,
            batching.max_consecutive_fatal,
        )?;

        let pb = create_progress_bar(pending_count, self.source.name(), PROGRESS_TEMPLATE);
        let total_superbatches = superbatches.len();

        for (index, superbatch) in superbatches.into_iter().enumerate() {
            if let Some(max) = batching.max_superbatches {
                if index >= max {
                    summary.stopped_early = true;
                    info!(
                        completed = index,
                        remaining = total_superbatches - index,
                        "Reached max_superbatches, leaving the rest for a later run"
                    );
                    break;
                }
            }

            for batch in &superbatch {
                for outcome in executor.run_batch(self.source.as_ref(), batch) {
                    summary.count(&outcome);
                    checkpointer.record(outcome)?;
                    pb.inc(1);
                }
                if executor.is_aborted() {
                    break;
                }
            }
            checkpointer.flush()?;
            summary.superbatches_run += 1;

            if let Some(err) = executor.abort_error() {
                pb.abandon_with_message("aborted");
                warn!(error = %err, "Run aborted; completed work has been checkpointed");
                return Err(err);
            }
        }

        // Derived columns wait until every input has been through the pipeline.
        let stats = if summary.stopped_early {
            checkpointer.stats()
        } else {
            checkpointer.finish(self.source.as_ref())?
        };
        summary.output_rows = stats.rows;
        summary.failed_inputs_total = stats.failed_inputs;

        pb.finish_with_message("done");
        info!("--------------------");
        info!("Fetch Summary ({}):", self.source.name());
        info!("  Inputs: {}", summary.inputs_total);
        info!("  Already resolved: {}", summary.inputs_already_resolved);
        info!("  Fetched: {}", summary.fetched);
        info!("  Not found: {}", summary.not_found);
        info!("  Failed (retried next run): {}", summary.failed);
        info!("  Output rows: {}", summary.output_rows);
        info!("  Output file: {}", self.config.output.path);
        info!("  Took: {}", HumanDuration(started.elapsed()));
        info!("--------------------");
        Ok(summary)
    }

    /// Writes remote fan-out payloads instead of fetching locally.
    pub fn emit_fanout(&self, dir: &Path) -> Result<usize> {
        let (inputs, _) = self.load_inputs()?;
        let tasks = inputs
            .iter()
            .map(|row| TaskDescriptor::for_row(self.source.as_ref(), row))
            .collect::<Result<Vec<_>>>()?;
        let invocations = plan_invocations(tasks, &self.config.fanout)?;
        write_fanout(dir, &self.config.fanout, &invocations)
    }
}
