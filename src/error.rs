use thiserror::Error;

/// Custom Result type for this crate.
pub type Result<T> = std::result::Result<T, FetchError>;

/// The Error type for fetch pipeline operations.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration validation error: {0}")]
    ConfigValidationError(String),

    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    #[error("Parquet error: {source}")]
    ParquetError {
        #[from]
        source: parquet::errors::ParquetError,
    },

    #[error("Arrow conversion error: {source}")]
    ArrowError {
        #[from]
        source: arrow::error::ArrowError,
    },

    #[error("CSV error: {source}")]
    CsvError {
        #[from]
        source: csv::Error,
    },

    #[error("Serialization/Deserialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },

    #[error("HTTP client error: {0}")]
    HttpError(String),

    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Input error: {0}")]
    InputError(String),

    #[error("Run aborted after {consecutive} consecutive fatal fetches, last: {last_reason}")]
    Aborted {
        consecutive: usize,
        last_reason: String,
    },

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl FetchError {
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        FetchError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

// reqwest errors only show up while building the client; per-request
// failures are classified by the fetcher instead of propagated.
impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::HttpError(err.to_string())
    }
}
