use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FetchError, Result};

/// Query parameters that carry credentials and are never logged.
pub const REDACTED_PARAMS: &[&str] = &["key", "$$app_token"];

/// One row of input parameters, e.g. an address, a coordinate or a census table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputRow {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

impl InputRow {
    pub fn new(id: impl Into<String>) -> Self {
        InputRow {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Field value trimmed, with a missing field read as "".
    pub fn field_or_empty(&self, name: &str) -> &str {
        self.field(name).map(str::trim).unwrap_or("")
    }

    /// Parses a numeric field, failing with an input error naming the row.
    pub fn parse_f64(&self, name: &str) -> Result<f64> {
        let raw = self.field_or_empty(name);
        raw.parse::<f64>().map_err(|_| {
            FetchError::InputError(format!(
                "Row '{}' has non-numeric value '{}' in column '{}'",
                self.id, raw, name
            ))
        })
    }
}

/// A fully formed request: endpoint plus ordered query parameters.
///
/// Built once by a request builder and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct FetchRequest {
    endpoint: String,
    params: Vec<(String, String)>,
    correlation_id: Option<String>,
}

impl FetchRequest {
    pub fn new(endpoint: impl Into<String>, params: Vec<(String, String)>) -> Self {
        FetchRequest {
            endpoint: endpoint.into(),
            params,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        FetchRequest {
            correlation_id: Some(id.into()),
            ..self
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Renders the full URL with a percent-encoded query string.
    pub fn url(&self) -> Result<reqwest::Url> {
        reqwest::Url::parse_with_params(&self.endpoint, &self.params).map_err(|e| {
            FetchError::invalid("endpoint", format!("'{}' is not a valid URL: {}", self.endpoint, e))
        })
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| {
                if REDACTED_PARAMS.contains(&k.as_str()) {
                    (k.as_str(), "<redacted>")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("FetchRequest")
            .field("endpoint", &self.endpoint)
            .field("params", &params)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

/// Raw response handed back by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        HttpResponse {
            status,
            content_type: Some("application/json".to_string()),
            body: value.to_string().into_bytes(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Outcome of a single fetch as classified by the fetcher.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Success(Payload),
    NotFound,
    TransientError(String),
    FatalError(String),
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchResult::Success(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchResult::FatalError(_))
    }
}

/// Parsed fields of a successful response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    pub records: Vec<Record>,
    pub attachment: Option<Attachment>,
}

impl Payload {
    pub fn single(record: Record) -> Self {
        Payload {
            records: vec![record],
            attachment: None,
        }
    }

    pub fn many(records: Vec<Record>) -> Self {
        Payload {
            records,
            attachment: None,
        }
    }
}

/// Binary body (an image) saved next to the table rather than inside it.
#[derive(Clone, PartialEq)]
pub struct Attachment {
    pub extension: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("extension", &self.extension)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Ok,
    NotFound,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Ok => "ok",
            RowStatus::NotFound => "not_found",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "ok" => Ok(RowStatus::Ok),
            "not_found" => Ok(RowStatus::NotFound),
            other => Err(FetchError::InputError(format!(
                "Unknown row status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Null,
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Converts a JSON scalar into a field value of the given column kind.
    pub fn from_json(value: &serde_json::Value, kind: ColumnKind) -> Self {
        match (value, kind) {
            (serde_json::Value::Null, _) => FieldValue::Null,
            (serde_json::Value::Number(n), ColumnKind::Float64) => {
                n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Null)
            }
            (serde_json::Value::String(s), ColumnKind::Float64) => s
                .trim()
                .parse::<f64>()
                .map(FieldValue::Number)
                .unwrap_or(FieldValue::Null),
            (serde_json::Value::String(s), ColumnKind::Utf8) => FieldValue::Text(s.clone()),
            (other, ColumnKind::Utf8) => FieldValue::Text(other.to_string()),
            (_, ColumnKind::Float64) => FieldValue::Null,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Null => Ok(()),
        }
    }
}

/// One output row, keyed by a stable identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub status: RowStatus,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Record {
            id: id.into(),
            status: RowStatus::Ok,
            fields: BTreeMap::new(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Record {
            status: RowStatus::NotFound,
            ..Record::new(id)
        }
    }

    pub fn with(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn set(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Field-wise merge: non-null values from `other` win.
    pub fn merge_from(&mut self, other: Record) {
        if other.status == RowStatus::Ok {
            self.status = RowStatus::Ok;
        }
        for (name, value) in other.fields {
            if value.is_null() && self.fields.contains_key(&name) {
                continue;
            }
            self.fields.insert(name, value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Utf8,
    Float64,
}

/// A declared output column of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn utf8(name: &str) -> Self {
        Column {
            name: name.to_string(),
            kind: ColumnKind::Utf8,
        }
    }

    pub fn float(name: &str) -> Self {
        Column {
            name: name.to_string(),
            kind: ColumnKind::Float64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retries exhausted on a throttle, timeout or server error.
    Transient,
    /// The API rejected the request outright.
    Fatal,
    /// The row itself could not be turned into a request.
    InvalidInput,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
            FailureKind::InvalidInput => "invalid_input",
        }
    }
}

/// What the executor reports for one input row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Fetched {
        input_id: String,
        payload: Payload,
    },
    NotFound {
        input_id: String,
        sentinel: Option<Record>,
    },
    Failed {
        input_id: String,
        reason: String,
        kind: FailureKind,
    },
    /// Never dispatched because the run was aborted.
    Skipped { input_id: String },
}

impl RowOutcome {
    pub fn input_id(&self) -> &str {
        match self {
            RowOutcome::Fetched { input_id, .. }
            | RowOutcome::NotFound { input_id, .. }
            | RowOutcome::Failed { input_id, .. }
            | RowOutcome::Skipped { input_id } => input_id,
        }
    }

    /// Whether the input counts as resolved for resume purposes.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            RowOutcome::Fetched { .. } | RowOutcome::NotFound { .. }
        )
    }
}
