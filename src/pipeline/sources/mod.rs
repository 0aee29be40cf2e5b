// src/pipeline/sources/mod.rs

pub mod census;
pub mod geocode;
pub mod open_data;
pub mod streetview;

pub use census::CensusSource;
pub use geocode::GeocodeSource;
pub use open_data::OpenDataSource;
pub use streetview::{StreetviewImageSource, StreetviewMetadataSource};

use std::collections::BTreeMap;

use crate::config::job::{resolve_api_key, SourceConfig};
use crate::data_model::{Column, FetchRequest, FetchResult, HttpResponse, InputRow, Payload, Record};
use crate::error::Result;

/// One external API: how to turn an input row into requests and a response into records.
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    /// Output columns after `id` and `status`. Must not change between runs.
    fn columns(&self) -> Vec<Column>;

    /// Sources that enumerate their own inputs (tables, pages) return them here.
    fn generate_inputs(&self) -> Option<Vec<InputRow>> {
        None
    }

    /// Identifier for rows read without an id column.
    fn derive_id(&self, _input: &InputRow) -> Option<String> {
        None
    }

    /// True when each input yields exactly one output row keyed by the input id.
    fn one_row_per_input(&self) -> bool {
        true
    }

    /// Rows rejected here are dropped before batching.
    fn accepts(&self, _input: &InputRow) -> bool {
        true
    }

    /// Fallback chain: the primary request first, then progressively relaxed ones.
    fn plan(&self, input: &InputRow) -> Result<Vec<FetchRequest>>;

    /// HTTP-level classification, applied before `interpret`.
    fn classify_status(&self, status: u16) -> Option<FetchResult> {
        classify_http_status(status)
    }

    fn interpret(
        &self,
        input: &InputRow,
        request: &FetchRequest,
        response: &HttpResponse,
    ) -> FetchResult;

    /// Second-phase request, issued only after the first phase succeeded.
    fn follow_up(&self, _input: &InputRow, _first: &Payload) -> Option<FetchRequest> {
        None
    }

    /// Combines the first-phase payload with the follow-up result.
    fn complete(&self, _input: &InputRow, first: Payload, _second: FetchResult) -> FetchResult {
        FetchResult::Success(first)
    }

    /// Row written when every request in the chain came back not-found.
    fn sentinel(&self, _input: &InputRow) -> Option<Record> {
        None
    }

    /// Applied to every row of the final table once the run completes.
    fn derive(&self, _record: &mut Record) {}

    fn has_derived_columns(&self) -> bool {
        false
    }

    /// Parameters handed to a remote worker for this row.
    fn task_params(&self, input: &InputRow) -> Result<BTreeMap<String, String>> {
        Ok(input.fields.clone())
    }

    /// Credential shipped with remote fan-out tasks, if the source has one.
    fn credential(&self) -> Option<&str> {
        None
    }
}

/// Default mapping of HTTP status codes onto the fetch taxonomy.
/// `None` means the body should be interpreted by the source.
pub fn classify_http_status(status: u16) -> Option<FetchResult> {
    match status {
        204 | 404 => Some(FetchResult::NotFound),
        200..=299 => None,
        408 | 429 => Some(FetchResult::TransientError(format!(
            "HTTP {} (throttled or timed out)",
            status
        ))),
        500..=599 => Some(FetchResult::TransientError(format!(
            "HTTP {} server error",
            status
        ))),
        401 | 403 => Some(FetchResult::FatalError(format!(
            "HTTP {}: credential rejected",
            status
        ))),
        other => Some(FetchResult::FatalError(format!(
            "HTTP {} unexpected status",
            other
        ))),
    }
}

/// Maps a Google Maps Platform `status` string. `None` means "OK".
pub fn classify_google_status(status: &str, error_message: Option<&str>) -> Option<FetchResult> {
    let detail = error_message.unwrap_or("");
    match status {
        "OK" => None,
        "ZERO_RESULTS" | "NOT_FOUND" => Some(FetchResult::NotFound),
        "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => Some(FetchResult::TransientError(format!(
            "Google status {} {}",
            status, detail
        ))),
        other => Some(FetchResult::FatalError(format!(
            "Google status {} {}",
            other, detail
        ))),
    }
}

/// Builds the source named in the job config, resolving credentials from the environment.
pub fn build_source(config: &SourceConfig) -> Result<Box<dyn Source>> {
    let source: Box<dyn Source> = match config {
        SourceConfig::Geocode(params) => {
            let api_key = resolve_api_key(&params.api_key_env)?;
            Box::new(GeocodeSource::new(params, api_key))
        }
        SourceConfig::StreetviewMetadata(params) => {
            let api_key = resolve_api_key(&params.api_key_env)?;
            Box::new(StreetviewMetadataSource::new(params, api_key)?)
        }
        SourceConfig::StreetviewImages(params) => {
            let api_key = resolve_api_key(&params.api_key_env)?;
            Box::new(StreetviewImageSource::new(params, api_key)?)
        }
        SourceConfig::Census(params) => {
            let api_key = resolve_api_key(&params.api_key_env)?;
            Box::new(CensusSource::new(params, api_key)?)
        }
        SourceConfig::OpenData(params) => {
            let app_token = match &params.app_token_env {
                Some(env_name) => Some(resolve_api_key(env_name)?),
                None => None,
            };
            Box::new(OpenDataSource::new(params, app_token)?)
        }
    };
    Ok(source)
}
