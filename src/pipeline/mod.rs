// src/pipeline/mod.rs

pub mod accumulator;
pub mod batcher;
pub mod fanout;
pub mod fetcher;
pub mod readers;
pub mod sources;
pub mod writers;
