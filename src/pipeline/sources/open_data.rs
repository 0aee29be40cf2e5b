// src/pipeline/sources/open_data.rs

use std::collections::HashMap;
use std::fs;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::job::{OpenDataParams, ValueFilter};
use crate::data_model::{
    Column, FetchRequest, FetchResult, FieldValue, HttpResponse, InputRow, Payload, Record,
};
use crate::error::{FetchError, Result};
use crate::pipeline::sources::{classify_http_status, Source};

/// Largest page the SODA endpoints accept.
pub const MAX_PAGE_SIZE: u64 = 50_000;

/// Builds paged SoQL `$query` requests against one dataset.
#[derive(Debug, Clone)]
pub struct SoqlQueryBuilder {
    base_url: String,
    dataset: String,
    select: Vec<String>,
    where_clause: Option<String>,
    order_by: Option<String>,
    page_size: u64,
    app_token: Option<String>,
}

impl SoqlQueryBuilder {
    pub fn new(params: &OpenDataParams, app_token: Option<String>) -> Result<Self> {
        if params.page_size == 0 || params.page_size > MAX_PAGE_SIZE {
            return Err(FetchError::invalid(
                "page_size",
                format!("{} is outside [1, {}]", params.page_size, MAX_PAGE_SIZE),
            ));
        }
        if params.dataset.trim().is_empty() {
            return Err(FetchError::invalid("dataset", "must not be empty"));
        }
        Ok(SoqlQueryBuilder {
            base_url: params.base_url.trim_end_matches('/').to_string(),
            dataset: params.dataset.clone(),
            select: params.select.clone(),
            where_clause: params.where_clause.clone(),
            order_by: params.order_by.clone(),
            page_size: params.page_size,
            app_token,
        })
    }

    pub fn query_for_page(&self, page: u64) -> String {
        let mut query = format!("SELECT {}", self.select.join(", "));
        if let Some(clause) = &self.where_clause {
            query.push_str(&format!(" WHERE {}", clause));
        }
        if let Some(order) = &self.order_by {
            query.push_str(&format!(" ORDER BY {}", order));
        }
        query.push_str(&format!(
            " LIMIT {} OFFSET {}",
            self.page_size,
            page * self.page_size
        ));
        query
    }

    pub fn page_request(&self, page: u64) -> FetchRequest {
        let mut params = vec![("$query".to_string(), self.query_for_page(page))];
        if let Some(token) = &self.app_token {
            params.push(("$$app_token".to_string(), token.clone()));
        }
        FetchRequest::new(
            format!("{}/resource/{}.json", self.base_url, self.dataset),
            params,
        )
    }
}

/// Maps a code column onto a class name; codes missing from the map drop the row.
#[derive(Debug, Clone)]
pub struct Classification {
    pub column: String,
    pub output_column: String,
    pub mapping: HashMap<String, String>,
}

impl Classification {
    pub fn classify(&self, record: &Record) -> Option<String> {
        let code = match record.get(&self.column) {
            Some(FieldValue::Text(code)) => code.trim().to_string(),
            Some(FieldValue::Number(n)) => n.to_string(),
            _ => return None,
        };
        self.mapping.get(&code).cloned()
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn matches_any(record: &Record, filter: &ValueFilter) -> bool {
    match record.get(&filter.column) {
        Some(FieldValue::Text(value)) => filter.values.iter().any(|v| v == value),
        _ => false,
    }
}

/// Paged records of a Socrata dataset, deduplicated by `id_field`.
pub struct OpenDataSource {
    builder: SoqlQueryBuilder,
    id_field: String,
    fields: Vec<String>,
    first_page: u64,
    page_count: u64,
    include: Vec<ValueFilter>,
    exclude: Vec<ValueFilter>,
    classification: Option<Classification>,
}

impl OpenDataSource {
    pub fn new(params: &OpenDataParams, app_token: Option<String>) -> Result<Self> {
        let classification = match &params.classification {
            Some(config) => {
                let raw = fs::read_to_string(&config.mapping_path).map_err(|e| {
                    FetchError::ConfigError(format!(
                        "Failed to read classification mapping '{}': {}",
                        config.mapping_path.display(),
                        e
                    ))
                })?;
                let mapping: HashMap<String, String> = serde_json::from_str(&raw)?;
                Some(Classification {
                    column: config.column.clone(),
                    output_column: config.output_column.clone(),
                    mapping,
                })
            }
            None => None,
        };
        let fields: Vec<String> = params
            .select
            .iter()
            .filter(|column| **column != params.id_field)
            .cloned()
            .collect();
        if let Some(reserved) = fields.iter().find(|c| *c == "id" || *c == "status") {
            return Err(FetchError::ConfigValidationError(format!(
                "Selected column '{}' collides with a reserved output column",
                reserved
            )));
        }
        Ok(OpenDataSource {
            builder: SoqlQueryBuilder::new(params, app_token)?,
            id_field: params.id_field.clone(),
            fields,
            first_page: params.first_page,
            page_count: params.page_count,
            include: params.include.clone(),
            exclude: params.exclude.clone(),
            classification,
        })
    }

    fn page_of(input: &InputRow) -> Result<u64> {
        input
            .field_or_empty("page")
            .parse()
            .map_err(|_| FetchError::InputError(format!("'{}' is not a page input", input.id)))
    }

    fn to_record(&self, object: &serde_json::Map<String, Value>) -> Option<Record> {
        let id = object.get(&self.id_field).and_then(scalar_text)?;
        let mut record = Record::new(id);
        for column in &self.fields {
            let value = object
                .get(column)
                .and_then(scalar_text)
                .map(FieldValue::Text)
                .unwrap_or(FieldValue::Null);
            record.set(column, value);
        }
        Some(record)
    }

    /// Applies include/exclude filters and the classification, returning kept rows.
    pub fn filter_records(&self, records: Vec<Record>) -> Vec<Record> {
        records
            .into_iter()
            .filter(|record| self.include.iter().all(|f| matches_any(record, f)))
            .filter(|record| !self.exclude.iter().any(|f| matches_any(record, f)))
            .filter_map(|mut record| match &self.classification {
                Some(classification) => match classification.classify(&record) {
                    Some(class) => {
                        record.set(&classification.output_column, FieldValue::Text(class));
                        Some(record)
                    }
                    None => {
                        debug!(id = %record.id, "Dropping row with unmapped classification code");
                        None
                    }
                },
                None => Some(record),
            })
            .collect()
    }
}

impl Source for OpenDataSource {
    fn name(&self) -> &'static str {
        "OpenData"
    }

    fn columns(&self) -> Vec<Column> {
        let mut columns: Vec<Column> = self.fields.iter().map(|c| Column::utf8(c)).collect();
        if let Some(classification) = &self.classification {
            columns.push(Column::utf8(&classification.output_column));
        }
        columns
    }

    fn generate_inputs(&self) -> Option<Vec<InputRow>> {
        Some(
            (self.first_page..self.first_page + self.page_count)
                .map(|page| {
                    InputRow::new(format!("page-{:06}", page)).with_field("page", page.to_string())
                })
                .collect(),
        )
    }

    fn one_row_per_input(&self) -> bool {
        false
    }

    fn plan(&self, input: &InputRow) -> Result<Vec<FetchRequest>> {
        let page = Self::page_of(input)?;
        Ok(vec![self
            .builder
            .page_request(page)
            .with_correlation_id(input.id.clone())])
    }

    /// A missing dataset is a configuration problem, not an empty page.
    fn classify_status(&self, status: u16) -> Option<FetchResult> {
        match status {
            404 => Some(FetchResult::FatalError(
                "HTTP 404: dataset not found".to_string(),
            )),
            other => classify_http_status(other),
        }
    }

    fn interpret(
        &self,
        input: &InputRow,
        _request: &FetchRequest,
        response: &HttpResponse,
    ) -> FetchResult {
        let value: Value = match serde_json::from_slice(&response.body) {
            Ok(value) => value,
            Err(e) => {
                return FetchResult::FatalError(format!("Malformed Open Data response: {}", e))
            }
        };
        let rows = match value.as_array() {
            Some(rows) => rows,
            None => {
                return FetchResult::FatalError(format!(
                    "Open Data response for {} is not a JSON array",
                    input.id
                ))
            }
        };
        if rows.is_empty() {
            return FetchResult::NotFound;
        }
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match row.as_object().and_then(|object| self.to_record(object)) {
                Some(record) => records.push(record),
                None => warn!(
                    page = %input.id,
                    id_field = %self.id_field,
                    "Skipping Open Data row without an id"
                ),
            }
        }
        FetchResult::Success(Payload::many(self.filter_records(records)))
    }
}
