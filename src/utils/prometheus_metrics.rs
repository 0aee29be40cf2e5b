// src/utils/prometheus_metrics.rs

use once_cell::sync::Lazy;
use prometheus::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};

// Requests
pub static FETCH_REQUESTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "fetch_requests_total",
        "Total number of HTTP requests issued, retries included."
    )
    .expect("Failed to register FETCH_REQUESTS_TOTAL counter")
});

pub static FETCH_RETRIES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "fetch_retries_total",
        "Total number of retries after transient failures."
    )
    .expect("Failed to register FETCH_RETRIES_TOTAL counter")
});

pub static FETCH_REQUEST_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "fetch_request_duration_seconds",
        "Histogram of single request latencies, including response interpretation."
    )
    .expect("Failed to register FETCH_REQUEST_DURATION_SECONDS histogram")
});

pub static ACTIVE_FETCHES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "fetch_active_requests",
        "Number of requests currently in flight."
    )
    .expect("Failed to register ACTIVE_FETCHES gauge")
});

// Rows
pub static ROWS_FETCHED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "fetch_rows_fetched_total",
        "Total number of input rows that returned data."
    )
    .expect("Failed to register ROWS_FETCHED_TOTAL counter")
});

pub static ROWS_NOT_FOUND_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "fetch_rows_not_found_total",
        "Total number of input rows that resolved to no data."
    )
    .expect("Failed to register ROWS_NOT_FOUND_TOTAL counter")
});

pub static ROWS_FAILED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "fetch_rows_failed_total",
        "Total number of input rows that failed and will be retried on the next run."
    )
    .expect("Failed to register ROWS_FAILED_TOTAL counter")
});

pub static ROWS_SKIPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "fetch_rows_skipped_total",
        "Total number of input rows never dispatched because the run aborted."
    )
    .expect("Failed to register ROWS_SKIPPED_TOTAL counter")
});

// Output
pub static CHECKPOINT_FLUSHES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "fetch_checkpoint_flushes_total",
        "Total number of checkpoint flushes to the output table."
    )
    .expect("Failed to register CHECKPOINT_FLUSHES_TOTAL counter")
});

pub static IMAGES_SAVED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "fetch_images_saved_total",
        "Total number of image files written."
    )
    .expect("Failed to register IMAGES_SAVED_TOTAL counter")
});
