// Utils

pub mod common;
pub mod prometheus_metrics;

pub use common::{create_progress_bar, init_tracing, setup_prometheus_metrics};
