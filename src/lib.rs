#![allow(non_snake_case)]

pub mod config;
pub mod data_model;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod runner;
pub mod utils;

pub use error::{FetchError, Result};
pub use runner::{JobRunner, RunSummary};
