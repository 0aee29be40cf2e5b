// src/bin/fetch.rs

//! # Fetch Binary
//!
//! Runs one batched fetch job described by a YAML job file:
//!
//! 1.  **Inputs**: rows are read from a CSV or Parquet file (addresses, points) or
//!     generated by the source itself (Census tables, Open Data pages).
//!
//! 2.  **Fetching**: rows are split into batches and fetched on a bounded worker pool,
//!     with retries and backoff for throttling and server errors.
//!
//! 3.  **Checkpointing**: after every superbatch the results are merged into the output
//!     table and a manifest next to it records which inputs are done. Rerunning the same
//!     job picks up where the last one stopped.
//!
//! With `--emit-fanout DIR` no requests are made; instead the batches are written as
//! JSON payloads for an external orchestrator.

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use UrbanFetch::config::cli::Args;
use UrbanFetch::config::load_job_config;
use UrbanFetch::utils::{init_tracing, setup_prometheus_metrics};
use UrbanFetch::JobRunner;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_json, args.log_dir.as_deref());

    let mut config = load_job_config(&args.config)
        .with_context(|| format!("Loading job config {}", args.config.display()))?;
    args.apply_overrides(&mut config)
        .context("Applying command-line overrides")?;
    config.validate().context("Invalid job config")?;

    if args.validate_config {
        info!(
            "Job config '{}' ({} source) is valid.",
            args.config.display(),
            config.source.name()
        );
        return Ok(());
    }

    if let Err(e) = setup_prometheus_metrics(args.metrics_port) {
        error!("Failed to start Prometheus metrics endpoint: {}", e);
    }

    info!("Fetch job starting.");
    info!("Source: {}", config.source.name());
    if let Some(input) = &config.input {
        info!("Input file: {}", input.path);
    }
    info!("Output file: {}", config.output.path);

    let runner = JobRunner::from_config(config).context("Setting up job")?;

    if let Some(dir) = &args.emit_fanout {
        let executions = runner
            .emit_fanout(dir)
            .with_context(|| format!("Writing fan-out payloads to {}", dir.display()))?;
        info!("Wrote {} fan-out executions to {}", executions, dir.display());
        return Ok(());
    }

    let summary = runner.run()?;
    if summary.failed_inputs_total > 0 {
        info!(
            "{} inputs failed and will be retried on the next run.",
            summary.failed_inputs_total
        );
    }
    Ok(())
}
