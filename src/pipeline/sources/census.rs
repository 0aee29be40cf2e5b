// src/pipeline/sources/census.rs

use serde_json::Value;

use crate::config::job::{CensusParams, DerivedRatio};
use crate::data_model::{
    Column, ColumnKind, FetchRequest, FetchResult, FieldValue, HttpResponse, InputRow, Payload,
    Record,
};
use crate::error::{FetchError, Result};
use crate::pipeline::sources::Source;

pub const CENSUS_URL: &str = "https://api.census.gov/data";

/// FIPS codes of the 50 states plus DC.
pub const STATE_FIPS: &[&str] = &[
    "01", "02", "04", "05", "06", "08", "09", "10", "11", "12", "13", "15", "16", "17", "18",
    "19", "20", "21", "22", "23", "24", "25", "26", "27", "28", "29", "30", "31", "32", "33",
    "34", "35", "36", "37", "38", "39", "40", "41", "42", "44", "45", "46", "47", "48", "49",
    "50", "51", "53", "54", "55", "56",
];

/// Columns concatenated, in this order, to form a GEOID.
const GEOID_PARTS: &[&str] = &["us", "state", "county", "tract"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Survey {
    Acs5,
    Acs1,
}

impl Survey {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "acs5" => Ok(Survey::Acs5),
            "acs1" => Ok(Survey::Acs1),
            other => Err(FetchError::invalid(
                "survey",
                format!("expected 'acs5' or 'acs1', got '{}'", other),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Survey::Acs5 => "acs5",
            Survey::Acs1 => "acs1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geography {
    Us,
    State,
    County,
    Tract,
}

impl Geography {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "us" => Ok(Geography::Us),
            "state" => Ok(Geography::State),
            "county" => Ok(Geography::County),
            "tract" => Ok(Geography::Tract),
            other => Err(FetchError::invalid(
                "geography",
                format!("expected us, state, county or tract, got '{}'", other),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Geography::Us => "us",
            Geography::State => "state",
            Geography::County => "county",
            Geography::Tract => "tract",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CensusRequestBuilder {
    endpoint: String,
    api_key: String,
    year: u32,
    survey: Survey,
    geography: Geography,
    state: Option<String>,
}

impl CensusRequestBuilder {
    pub fn new(
        api_key: impl Into<String>,
        year: u32,
        survey: Survey,
        geography: Geography,
        state: Option<String>,
    ) -> Result<Self> {
        if let Some(fips) = &state {
            if !STATE_FIPS.contains(&fips.as_str()) {
                return Err(FetchError::invalid(
                    "state",
                    format!("'{}' is not a known state FIPS code", fips),
                ));
            }
            if geography == Geography::Us {
                return Err(FetchError::invalid(
                    "state",
                    "cannot restrict the 'us' geography to a state",
                ));
            }
        } else if geography == Geography::Tract {
            return Err(FetchError::invalid(
                "state",
                "tract-level queries need a state FIPS code",
            ));
        }
        Ok(CensusRequestBuilder {
            endpoint: CENSUS_URL.to_string(),
            api_key: api_key.into(),
            year,
            survey,
            geography,
            state,
        })
    }

    pub fn with_endpoint(self, endpoint: impl Into<String>) -> Self {
        CensusRequestBuilder {
            endpoint: endpoint.into(),
            ..self
        }
    }

    pub fn table_request(&self, table: &str) -> FetchRequest {
        let mut params = vec![
            ("get".to_string(), table.to_string()),
            ("for".to_string(), format!("{}:*", self.geography.as_str())),
        ];
        if let Some(fips) = &self.state {
            params.push(("in".to_string(), format!("state:{}", fips)));
        }
        params.push(("key".to_string(), self.api_key.clone()));
        FetchRequest::new(
            format!(
                "{}/{}/acs/{}",
                self.endpoint.trim_end_matches('/'),
                self.year,
                self.survey.as_str()
            ),
            params,
        )
    }
}

/// Parses a Census array-of-arrays response into one record per geography.
pub fn parse_table(body: &[u8], table: &str, column: &str) -> Result<Vec<Record>> {
    let value: Value = serde_json::from_slice(body)?;
    let rows = value.as_array().ok_or_else(|| {
        FetchError::Unexpected("Census response is not an array of rows".to_string())
    })?;
    let header: Vec<&str> = match rows.first().and_then(Value::as_array) {
        Some(header) => header.iter().map(|h| h.as_str().unwrap_or("")).collect(),
        None => return Ok(Vec::new()),
    };
    let value_index = header.iter().position(|h| *h == table).unwrap_or(0);
    let geoid_indexes: Vec<usize> = GEOID_PARTS
        .iter()
        .filter_map(|part| header.iter().position(|h| h == part))
        .collect();
    if geoid_indexes.is_empty() {
        return Err(FetchError::Unexpected(
            "Census response header has no geography columns".to_string(),
        ));
    }

    let mut records = Vec::with_capacity(rows.len().saturating_sub(1));
    for row in rows.iter().skip(1) {
        let cells = row.as_array().ok_or_else(|| {
            FetchError::Unexpected("Census response row is not an array".to_string())
        })?;
        let geoid: String = geoid_indexes
            .iter()
            .map(|i| cells.get(*i).and_then(Value::as_str).unwrap_or(""))
            .collect();
        let value = cells
            .get(value_index)
            .map(|v| FieldValue::from_json(v, ColumnKind::Float64))
            .unwrap_or(FieldValue::Null);
        records.push(Record::new(geoid).with(column, value));
    }
    Ok(records)
}

/// `scale * sum(numerators) / denominator`, or null when any input is missing or the
/// denominator is zero.
pub fn compute_ratio(record: &Record, ratio: &DerivedRatio) -> FieldValue {
    let denominator = match record.get(&ratio.denominator).and_then(FieldValue::as_f64) {
        Some(d) if d != 0.0 => d,
        _ => return FieldValue::Null,
    };
    let mut sum = 0.0;
    for name in &ratio.numerators {
        match record.get(name).and_then(FieldValue::as_f64) {
            Some(v) => sum += v,
            None => return FieldValue::Null,
        }
    }
    FieldValue::Number(ratio.scale * sum / denominator)
}

/// ACS tables, one request per table, outer-joined on GEOID.
pub struct CensusSource {
    builder: CensusRequestBuilder,
    tables: Vec<(String, String)>,
    derived: Vec<DerivedRatio>,
}

impl CensusSource {
    pub fn new(params: &CensusParams, api_key: String) -> Result<Self> {
        let mut builder = CensusRequestBuilder::new(
            api_key,
            params.year,
            Survey::parse(&params.survey)?,
            Geography::parse(&params.geography)?,
            params.state.clone(),
        )?;
        if let Some(endpoint) = &params.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        Ok(CensusSource {
            builder,
            tables: params.tables.pairs(),
            derived: params.derived.clone(),
        })
    }

    fn column_for<'a>(&'a self, table: &'a str) -> &'a str {
        self.tables
            .iter()
            .find(|(t, _)| t == table)
            .map(|(_, alias)| alias.as_str())
            .unwrap_or(table)
    }
}

impl Source for CensusSource {
    fn name(&self) -> &'static str {
        "Census"
    }

    fn columns(&self) -> Vec<Column> {
        self.tables
            .iter()
            .map(|(_, alias)| Column::float(alias))
            .chain(self.derived.iter().map(|ratio| Column::float(&ratio.name)))
            .collect()
    }

    fn generate_inputs(&self) -> Option<Vec<InputRow>> {
        Some(
            self.tables
                .iter()
                .map(|(table, alias)| InputRow::new(table.clone()).with_field("column", alias.clone()))
                .collect(),
        )
    }

    fn one_row_per_input(&self) -> bool {
        false
    }

    fn plan(&self, input: &InputRow) -> Result<Vec<FetchRequest>> {
        Ok(vec![self
            .builder
            .table_request(&input.id)
            .with_correlation_id(input.id.clone())])
    }

    fn interpret(
        &self,
        input: &InputRow,
        _request: &FetchRequest,
        response: &HttpResponse,
    ) -> FetchResult {
        match parse_table(&response.body, &input.id, self.column_for(&input.id)) {
            Ok(records) if records.is_empty() => FetchResult::NotFound,
            Ok(records) => FetchResult::Success(Payload::many(records)),
            Err(e) => FetchResult::FatalError(format!(
                "Could not parse Census table {}: {} (body starts {:?})",
                input.id,
                e,
                response.body_text().chars().take(80).collect::<String>()
            )),
        }
    }

    fn derive(&self, record: &mut Record) {
        for ratio in &self.derived {
            let value = compute_ratio(record, ratio);
            record.set(&ratio.name, value);
        }
    }

    fn has_derived_columns(&self) -> bool {
        !self.derived.is_empty()
    }

    fn credential(&self) -> Option<&str> {
        Some(&self.builder.api_key)
    }
}
