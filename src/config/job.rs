use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::input::{InputConfig, OutputConfig};
use crate::error::{FetchError, Result};

/// A complete fetch job as read from YAML.
#[derive(Deserialize, Debug, Clone)]
pub struct JobConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub input: Option<InputConfig>,
    pub output: OutputConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub fanout: FanOutConfig,
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        self.batching.validate()?;
        self.retry.validate()?;
        self.http.validate()?;
        self.fanout.validate()?;
        self.source.validate()?;

        if self.source.needs_input() && self.input.is_none() {
            return Err(FetchError::ConfigValidationError(format!(
                "{} jobs need an `input` section",
                self.source.name()
            )));
        }
        if matches!(self.source, SourceConfig::StreetviewImages(_))
            && self.output.images_dir.is_none()
        {
            return Err(FetchError::ConfigValidationError(
                "StreetviewImages jobs need `output.images_dir`".to_string(),
            ));
        }
        self.output.resolved_format()?;
        if let Some(input) = &self.input {
            input.resolved_format()?;
        }
        Ok(())
    }
}

/// Which external API a job talks to.
/// Uses Serde's internally tagged enum representation.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum SourceConfig {
    Geocode(GeocodeParams),
    StreetviewMetadata(StreetviewParams),
    StreetviewImages(StreetviewParams),
    Census(CensusParams),
    OpenData(OpenDataParams),
}

impl SourceConfig {
    pub fn name(&self) -> &'static str {
        match self {
            SourceConfig::Geocode(_) => "Geocode",
            SourceConfig::StreetviewMetadata(_) => "StreetviewMetadata",
            SourceConfig::StreetviewImages(_) => "StreetviewImages",
            SourceConfig::Census(_) => "Census",
            SourceConfig::OpenData(_) => "OpenData",
        }
    }

    /// Census tables and Open Data pages are generated, everything else reads rows.
    pub fn needs_input(&self) -> bool {
        matches!(
            self,
            SourceConfig::Geocode(_)
                | SourceConfig::StreetviewMetadata(_)
                | SourceConfig::StreetviewImages(_)
        )
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SourceConfig::Census(params) => params.validate(),
            SourceConfig::OpenData(params) => params.validate(),
            SourceConfig::Geocode(_)
            | SourceConfig::StreetviewMetadata(_)
            | SourceConfig::StreetviewImages(_) => Ok(()),
        }
    }
}

fn default_google_key_env() -> String {
    "GOOGLE_MAPS_API_KEY".to_string()
}

fn default_census_key_env() -> String {
    "CENSUS_API_KEY".to_string()
}

/// Parameters for the Geocode source.
#[derive(Deserialize, Debug, Clone)]
pub struct GeocodeParams {
    #[serde(default = "default_google_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_address_column")]
    pub address_column: String,
    #[serde(default = "default_city_column")]
    pub city_column: String,
    #[serde(default = "default_state_column")]
    pub state_column: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_address_column() -> String {
    "Address".to_string()
}

fn default_city_column() -> String {
    "City".to_string()
}

fn default_state_column() -> String {
    "State".to_string()
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl Default for ImageSize {
    fn default() -> Self {
        ImageSize {
            width: 600,
            height: 400,
        }
    }
}

/// Parameters shared by the two Street View sources.
#[derive(Deserialize, Debug, Clone)]
pub struct StreetviewParams {
    #[serde(default = "default_google_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_latitude_column")]
    pub latitude_column: String,
    #[serde(default = "default_longitude_column")]
    pub longitude_column: String,
    /// When absent a heading in [0, 360) is drawn per row.
    #[serde(default)]
    pub heading_column: Option<String>,
    #[serde(default)]
    pub heading_seed: u64,
    #[serde(default)]
    pub fov: Option<f64>,
    #[serde(default)]
    pub pitch: Option<f64>,
    #[serde(default)]
    pub radius: Option<i64>,
    #[serde(default)]
    pub size: ImageSize,
    #[serde(default = "default_image_source")]
    pub source: String,
    /// Rows of an images job are only fetched when this column reads "ok".
    #[serde(default)]
    pub status_column: Option<String>,
    #[serde(default)]
    pub metadata_endpoint: Option<String>,
    #[serde(default)]
    pub image_endpoint: Option<String>,
}

fn default_latitude_column() -> String {
    "latitude".to_string()
}

fn default_longitude_column() -> String {
    "longitude".to_string()
}

fn default_image_source() -> String {
    "outdoor".to_string()
}

/// Either a list of table ids or a map of table id to column alias.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum TableSelection {
    List(Vec<String>),
    Aliased(BTreeMap<String, String>),
}

impl TableSelection {
    /// (table id, output column) pairs in a stable order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        match self {
            TableSelection::List(tables) => tables.iter().map(|t| (t.clone(), t.clone())).collect(),
            TableSelection::Aliased(map) => {
                map.iter().map(|(t, a)| (t.clone(), a.clone())).collect()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TableSelection::List(tables) => tables.is_empty(),
            TableSelection::Aliased(map) => map.is_empty(),
        }
    }
}

/// `scale * sum(numerators) / denominator`, computed on the final table.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DerivedRatio {
    pub name: String,
    pub numerators: Vec<String>,
    pub denominator: String,
    #[serde(default = "default_ratio_scale")]
    pub scale: f64,
}

fn default_ratio_scale() -> f64 {
    100.0
}

/// Parameters for the Census ACS source.
#[derive(Deserialize, Debug, Clone)]
pub struct CensusParams {
    #[serde(default = "default_census_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_census_year")]
    pub year: u32,
    #[serde(default = "default_survey")]
    pub survey: String,
    #[serde(default = "default_geography")]
    pub geography: String,
    #[serde(default)]
    pub state: Option<String>,
    pub tables: TableSelection,
    #[serde(default)]
    pub derived: Vec<DerivedRatio>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_census_year() -> u32 {
    2022
}

fn default_survey() -> String {
    "acs5".to_string()
}

fn default_geography() -> String {
    "county".to_string()
}

impl CensusParams {
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(FetchError::ConfigValidationError(
                "Census tables must not be empty".to_string(),
            ));
        }
        let columns: Vec<String> = self.tables.pairs().into_iter().map(|(_, a)| a).collect();
        for ratio in &self.derived {
            if ratio.numerators.is_empty() {
                return Err(FetchError::ConfigValidationError(format!(
                    "Derived column '{}' has no numerators",
                    ratio.name
                )));
            }
            for needed in ratio.numerators.iter().chain(std::iter::once(&ratio.denominator)) {
                if !columns.contains(needed) {
                    return Err(FetchError::ConfigValidationError(format!(
                        "Derived column '{}' refers to unknown column '{}'",
                        ratio.name, needed
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ValueFilter {
    pub column: String,
    pub values: Vec<String>,
}

/// Maps a code column to a class through a JSON object file; unmapped rows are dropped.
#[derive(Deserialize, Debug, Clone)]
pub struct ClassificationConfig {
    pub column: String,
    pub mapping_path: PathBuf,
    pub output_column: String,
}

/// Parameters for the Socrata Open Data source.
#[derive(Deserialize, Debug, Clone)]
pub struct OpenDataParams {
    #[serde(default = "default_open_data_base")]
    pub base_url: String,
    pub dataset: String,
    pub select: Vec<String>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub order_by: Option<String>,
    pub id_field: String,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default)]
    pub first_page: u64,
    pub page_count: u64,
    #[serde(default)]
    pub app_token_env: Option<String>,
    #[serde(default)]
    pub include: Vec<ValueFilter>,
    #[serde(default)]
    pub exclude: Vec<ValueFilter>,
    #[serde(default)]
    pub classification: Option<ClassificationConfig>,
}

fn default_open_data_base() -> String {
    "https://data.cityofchicago.org".to_string()
}

fn default_page_size() -> u64 {
    1000
}

impl OpenDataParams {
    pub fn validate(&self) -> Result<()> {
        if self.select.is_empty() {
            return Err(FetchError::ConfigValidationError(
                "OpenData `select` must list at least one column".to_string(),
            ));
        }
        if !self.select.contains(&self.id_field) {
            return Err(FetchError::ConfigValidationError(format!(
                "OpenData id_field '{}' must be one of the selected columns",
                self.id_field
            )));
        }
        if self.page_count == 0 {
            return Err(FetchError::ConfigValidationError(
                "OpenData page_count must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// How inputs are split and dispatched.
#[derive(Deserialize, Debug, Clone)]
pub struct BatchingConfig {
    /// Rows per batch; ignored when `num_batches` is set.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub num_batches: Option<usize>,
    /// Batches per checkpoint flush.
    #[serde(default = "default_superbatch_size")]
    pub superbatch_size: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_consecutive_fatal")]
    pub max_consecutive_fatal: usize,
    #[serde(default = "default_true")]
    pub resume: bool,
    /// Stop after this many superbatches; the rest is left for a rerun.
    #[serde(default)]
    pub max_superbatches: Option<usize>,
}

fn default_batch_size() -> usize {
    1000
}

fn default_superbatch_size() -> usize {
    10
}

fn default_pool_size() -> usize {
    7
}

fn default_max_consecutive_fatal() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl Default for BatchingConfig {
    fn default() -> Self {
        BatchingConfig {
            batch_size: default_batch_size(),
            num_batches: None,
            superbatch_size: default_superbatch_size(),
            pool_size: default_pool_size(),
            max_consecutive_fatal: default_max_consecutive_fatal(),
            resume: true,
            max_superbatches: None,
        }
    }
}

impl BatchingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(FetchError::ConfigValidationError(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.num_batches == Some(0) {
            return Err(FetchError::ConfigValidationError(
                "num_batches must be greater than 0".to_string(),
            ));
        }
        if self.superbatch_size == 0 {
            return Err(FetchError::ConfigValidationError(
                "superbatch_size must be greater than 0".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(FetchError::ConfigValidationError(
                "pool_size must be greater than 0".to_string(),
            ));
        }
        if self.max_consecutive_fatal == 0 {
            return Err(FetchError::ConfigValidationError(
                "max_consecutive_fatal must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry policy for transient failures: bounded attempts, exponential backoff.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(FetchError::ConfigValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(FetchError::ConfigValidationError(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("UrbanFetch/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(FetchError::ConfigValidationError(
                "http.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Contract with an external orchestrator that fans batches out to remote workers.
#[derive(Deserialize, Debug, Clone)]
pub struct FanOutConfig {
    /// Function or service the orchestrator invokes for each batch.
    #[serde(default = "default_worker_resource")]
    pub worker_resource: String,
    #[serde(default = "default_fanout_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_batches_per_invocation")]
    pub batches_per_invocation: usize,
    #[serde(default = "default_fanout_superbatches")]
    pub superbatches: usize,
    #[serde(default)]
    pub retry: FanOutRetry,
}

fn default_worker_resource() -> String {
    "${FetchWorkerArn}".to_string()
}

fn default_fanout_concurrency() -> u32 {
    10
}

fn default_batches_per_invocation() -> usize {
    10
}

fn default_fanout_superbatches() -> usize {
    100
}

impl Default for FanOutConfig {
    fn default() -> Self {
        FanOutConfig {
            worker_resource: default_worker_resource(),
            max_concurrency: default_fanout_concurrency(),
            batches_per_invocation: default_batches_per_invocation(),
            superbatches: default_fanout_superbatches(),
            retry: FanOutRetry::default(),
        }
    }
}

impl FanOutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 || self.batches_per_invocation == 0 || self.superbatches == 0 {
            return Err(FetchError::ConfigValidationError(
                "fanout max_concurrency, batches_per_invocation and superbatches must be > 0"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FanOutRetry {
    #[serde(default = "default_error_equals")]
    pub error_equals: Vec<String>,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_fanout_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_rate: f64,
}

fn default_error_equals() -> Vec<String> {
    [
        "Lambda.ServiceException",
        "Lambda.AWSLambdaException",
        "Lambda.SdkClientException",
        "Lambda.TooManyRequestsException",
        "States.TaskFailed",
        "Lambda.Unknown",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_interval_seconds() -> u64 {
    2
}

fn default_fanout_attempts() -> u32 {
    1
}

impl Default for FanOutRetry {
    fn default() -> Self {
        FanOutRetry {
            error_equals: default_error_equals(),
            interval_seconds: default_interval_seconds(),
            max_attempts: default_fanout_attempts(),
            backoff_rate: default_backoff_multiplier(),
        }
    }
}

/// Loads and parses the job configuration YAML file.
pub fn load_job_config<P: AsRef<Path>>(config_path: P) -> Result<JobConfig> {
    let path_ref = config_path.as_ref();
    let config_content = fs::read_to_string(path_ref).map_err(|e| {
        FetchError::ConfigError(format!(
            "Failed to read job config file '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    serde_yaml::from_str(&config_content).map_err(|e| {
        FetchError::ConfigError(format!(
            "Failed to parse job config YAML from '{}': {}",
            path_ref.display(),
            e
        ))
    })
}

/// Reads an API credential from the named environment variable.
pub fn resolve_api_key(env_name: &str) -> Result<String> {
    match std::env::var(env_name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        Ok(_) => Err(FetchError::ConfigError(format!(
            "Environment variable '{}' is empty",
            env_name
        ))),
        Err(_) => Err(FetchError::ConfigError(format!(
            "Environment variable '{}' is not set",
            env_name
        ))),
    }
}
