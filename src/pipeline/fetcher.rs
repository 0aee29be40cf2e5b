// src/pipeline/fetcher.rs

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, instrument, warn};

use crate::config::job::{HttpConfig, RetryPolicy};
use crate::data_model::{FetchRequest, FetchResult, HttpResponse, InputRow};
use crate::error::Result;
use crate::pipeline::sources::Source;
use crate::utils::prometheus_metrics::*;

/// Why a transport could not produce a response at all.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Connection refused, reset, DNS or timeout. Worth retrying.
    Network(String),
    /// The request could not be sent as built.
    InvalidRequest(String),
}

/// Performs one HTTP GET. Implemented by the real client and by test doubles.
pub trait Transport: Send + Sync {
    fn get(&self, request: &FetchRequest) -> std::result::Result<HttpResponse, TransportError>;
}

/// Blocking reqwest client shared by every worker thread.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, request: &FetchRequest) -> std::result::Result<HttpResponse, TransportError> {
        let url = request
            .url()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        // Error messages must not carry the URL: it holds the API key.
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| TransportError::Network(e.without_url().to_string()))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .map_err(|e| TransportError::Network(e.without_url().to_string()))?
            .to_vec();
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Issues requests for a source, retrying transient failures and walking fallback chains.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Fetcher { transport, retry }
    }

    fn fetch_once(
        &self,
        source: &dyn Source,
        input: &InputRow,
        request: &FetchRequest,
    ) -> FetchResult {
        FETCH_REQUESTS_TOTAL.inc();
        ACTIVE_FETCHES.inc();
        let started = Instant::now();
        let result = match self.transport.get(request) {
            Ok(response) => source
                .classify_status(response.status)
                .unwrap_or_else(|| source.interpret(input, request, &response)),
            Err(TransportError::Network(reason)) => FetchResult::TransientError(reason),
            Err(TransportError::InvalidRequest(reason)) => FetchResult::FatalError(reason),
        };
        FETCH_REQUEST_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        ACTIVE_FETCHES.dec();
        result
    }

    /// One request, retried on transient failures up to the policy's attempt limit.
    pub fn fetch(
        &self,
        source: &dyn Source,
        input: &InputRow,
        request: &FetchRequest,
    ) -> FetchResult {
        let mut attempt: u32 = 1;
        loop {
            match self.fetch_once(source, input, request) {
                FetchResult::TransientError(reason) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        source = source.name(),
                        input_id = %input.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "Transient failure, retrying"
                    );
                    FETCH_RETRIES_TOTAL.inc();
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Walks the chain until something other than not-found comes back.
    pub fn fetch_with_fallback(
        &self,
        source: &dyn Source,
        input: &InputRow,
        chain: &[FetchRequest],
    ) -> FetchResult {
        for (depth, request) in chain.iter().enumerate() {
            match self.fetch(source, input, request) {
                FetchResult::NotFound => {
                    debug!(
                        source = source.name(),
                        input_id = %input.id,
                        depth,
                        "Not found, relaxing request"
                    );
                }
                other => return other,
            }
        }
        FetchResult::NotFound
    }

    /// Full treatment of one input row: plan, fallback chain, then any follow-up phase.
    ///
    /// Errors only when the row cannot be turned into a request.
    #[instrument(skip(self, source, input), fields(source = source.name(), input_id = %input.id))]
    pub fn fetch_row(&self, source: &dyn Source, input: &InputRow) -> Result<FetchResult> {
        let chain = source.plan(input)?;
        let first = self.fetch_with_fallback(source, input, &chain);
        let payload = match first {
            FetchResult::Success(payload) => payload,
            other => return Ok(other),
        };
        match source.follow_up(input, &payload) {
            Some(request) => {
                let second = self.fetch(source, input, &request);
                Ok(source.complete(input, payload, second))
            }
            None => Ok(FetchResult::Success(payload)),
        }
    }
}
