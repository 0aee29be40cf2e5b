// --- Command-Line Arguments Struct ---
// Kept in the library so tests can build `Args` without spawning the binary.
use std::path::PathBuf;

use clap::Parser;

use crate::config::job::JobConfig;
use crate::error::{FetchError, Result};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the job configuration YAML file.
    #[arg(short = 'c', long, default_value = "config/job.yaml")]
    pub config: PathBuf,

    /// Override the input file named in the job config.
    #[arg(short, long)]
    pub input_file: Option<String>,

    /// Override the output file named in the job config.
    #[arg(short, long)]
    pub output_file: Option<String>,

    /// Validate the job configuration and exit
    #[arg(long)]
    pub validate_config: bool,

    /// Ignore any previous checkpoint and start from scratch.
    #[arg(long)]
    pub no_resume: bool,

    /// Stop after this many superbatches (useful for trial runs).
    #[arg(long)]
    pub max_superbatches: Option<usize>,

    /// Override the worker pool size.
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Write remote fan-out payloads to this directory instead of fetching.
    #[arg(long)]
    pub emit_fanout: Option<PathBuf>,

    /// Optional: Port for the Prometheus metrics HTTP endpoint
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Also write logs to a daily rolling file in this directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Args {
    /// Applies command-line overrides on top of the loaded job config.
    ///
    /// `--input-file` is an error for sources that generate their own inputs.
    pub fn apply_overrides(&self, config: &mut JobConfig) -> Result<()> {
        if let Some(input_file) = &self.input_file {
            match config.input.as_mut() {
                Some(input) => input.path = input_file.clone(),
                None => {
                    return Err(FetchError::ConfigError(format!(
                        "--input-file given, but the {} source reads no input table",
                        config.source.name()
                    )))
                }
            }
        }
        if let Some(output_file) = &self.output_file {
            config.output.path = output_file.clone();
        }
        if self.no_resume {
            config.batching.resume = false;
        }
        if let Some(max) = self.max_superbatches {
            config.batching.max_superbatches = Some(max);
        }
        if let Some(pool_size) = self.pool_size {
            config.batching.pool_size = pool_size;
        }
        Ok(())
    }
}
