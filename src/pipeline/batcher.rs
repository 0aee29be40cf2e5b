// src/pipeline/batcher.rs

use crate::config::job::BatchingConfig;
use crate::error::{FetchError, Result};

/// Splits `rows` into `min(n, len)` contiguous batches of `len / n` rows each; the last batch
/// takes the remainder. Concatenating the batches gives back `rows` in order.
pub fn split_into_batches<T>(rows: Vec<T>, n: usize) -> Result<Vec<Vec<T>>> {
    if n == 0 {
        return Err(FetchError::invalid("num_batches", "must be greater than 0"));
    }
    let total = rows.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let count = n.min(total);
    let base = total / count;
    let mut iter = rows.into_iter();
    let mut batches = Vec::with_capacity(count);
    for index in 0..count {
        let take = if index + 1 == count {
            total - base * (count - 1)
        } else {
            base
        };
        batches.push(iter.by_ref().take(take).collect());
    }
    Ok(batches)
}

/// Fixed-size batches; only the last one may be shorter.
pub fn chunk_by_size<T>(rows: Vec<T>, size: usize) -> Result<Vec<Vec<T>>> {
    if size == 0 {
        return Err(FetchError::invalid("batch_size", "must be greater than 0"));
    }
    let mut batches = Vec::with_capacity(rows.len().div_ceil(size));
    let mut iter = rows.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    Ok(batches)
}

/// Groups consecutive batches into superbatches of `k`; the last may hold fewer.
pub fn group_superbatches<T>(batches: Vec<Vec<T>>, k: usize) -> Result<Vec<Vec<Vec<T>>>> {
    chunk_by_size(batches, k)
        .map_err(|_| FetchError::invalid("superbatch_size", "must be greater than 0"))
}

/// Batches according to the job's batching section.
pub fn plan_batches<T>(rows: Vec<T>, config: &BatchingConfig) -> Result<Vec<Vec<T>>> {
    match config.num_batches {
        Some(n) => split_into_batches(rows, n),
        None => chunk_by_size(rows, config.batch_size),
    }
}
