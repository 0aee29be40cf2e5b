// src/config.rs

pub mod cli;
pub mod input;
pub mod job;

pub use input::{InputConfig, OutputConfig, TableFormat};
pub use job::{load_job_config, JobConfig, SourceConfig};
