// src/pipeline/sources/geocode.rs

use serde::Deserialize;

use crate::config::job::GeocodeParams;
use crate::data_model::{
    Column, FetchRequest, FetchResult, FieldValue, HttpResponse, InputRow, Payload, Record,
};
use crate::error::Result;
use crate::pipeline::sources::{classify_google_status, Source};

pub const GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Written for addresses that resolve at no granularity.
pub const SENTINEL_COORDINATE: f64 = -999.0;

/// Builds Geocoding API requests from address components.
#[derive(Debug, Clone)]
pub struct GeocodeRequestBuilder {
    endpoint: String,
    api_key: String,
}

impl GeocodeRequestBuilder {
    pub fn new(api_key: impl Into<String>) -> Self {
        GeocodeRequestBuilder {
            endpoint: GEOCODE_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_endpoint(self, endpoint: impl Into<String>) -> Self {
        GeocodeRequestBuilder {
            endpoint: endpoint.into(),
            ..self
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// `None` when every component is empty.
    pub fn build(&self, components: &[&str]) -> Option<FetchRequest> {
        let address = components
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if address.is_empty() {
            return None;
        }
        Some(FetchRequest::new(
            self.endpoint.clone(),
            vec![
                ("sensor".to_string(), "false".to_string()),
                ("address".to_string(), address),
                ("key".to_string(), self.api_key.clone()),
            ],
        ))
    }

    /// Full address first, then city and state only. At most two entries.
    pub fn fallback_chain(&self, address: &str, city: &str, state: &str) -> Vec<FetchRequest> {
        let mut chain = Vec::with_capacity(2);
        if !address.trim().is_empty() {
            chain.extend(self.build(&[address, city, state]));
        }
        chain.extend(self.build(&[city, state]));
        chain
    }
}

#[derive(Deserialize, Debug)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeocodeResult {
    geometry: Geometry,
    #[serde(default)]
    formatted_address: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Geometry {
    location: LatLng,
}

#[derive(Deserialize, Debug)]
struct LatLng {
    lat: f64,
    lng: f64,
}

/// Address → (lat, long), falling back to city level, then to the sentinel.
pub struct GeocodeSource {
    builder: GeocodeRequestBuilder,
    address_column: String,
    city_column: String,
    state_column: String,
}

impl GeocodeSource {
    pub fn new(params: &GeocodeParams, api_key: String) -> Self {
        let mut builder = GeocodeRequestBuilder::new(api_key);
        if let Some(endpoint) = &params.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        GeocodeSource {
            builder,
            address_column: params.address_column.clone(),
            city_column: params.city_column.clone(),
            state_column: params.state_column.clone(),
        }
    }

    fn components<'a>(&self, input: &'a InputRow) -> [&'a str; 3] {
        [
            input.field_or_empty(&self.address_column),
            input.field_or_empty(&self.city_column),
            input.field_or_empty(&self.state_column),
        ]
    }
}

impl Source for GeocodeSource {
    fn name(&self) -> &'static str {
        "Geocode"
    }

    fn columns(&self) -> Vec<Column> {
        vec![
            Column::float("lat"),
            Column::float("long"),
            Column::utf8("formatted_address"),
        ]
    }

    /// Space-joined address components, matching how the address lists were keyed.
    fn derive_id(&self, input: &InputRow) -> Option<String> {
        Some(self.components(input).join(" "))
    }

    fn plan(&self, input: &InputRow) -> Result<Vec<FetchRequest>> {
        let [address, city, state] = self.components(input);
        Ok(self
            .builder
            .fallback_chain(address, city, state)
            .into_iter()
            .map(|request| request.with_correlation_id(input.id.clone()))
            .collect())
    }

    fn interpret(
        &self,
        input: &InputRow,
        _request: &FetchRequest,
        response: &HttpResponse,
    ) -> FetchResult {
        let parsed: GeocodeResponse = match serde_json::from_slice(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return FetchResult::FatalError(format!("Malformed geocode response: {}", e))
            }
        };
        if let Some(result) = classify_google_status(&parsed.status, parsed.error_message.as_deref())
        {
            return result;
        }
        match parsed.results.first() {
            Some(first) => {
                let location = &first.geometry.location;
                let formatted = match &first.formatted_address {
                    Some(address) => FieldValue::text(address.clone()),
                    None => FieldValue::Null,
                };
                FetchResult::Success(Payload::single(
                    Record::new(input.id.clone())
                        .with("lat", FieldValue::Number(location.lat))
                        .with("long", FieldValue::Number(location.lng))
                        .with("formatted_address", formatted),
                ))
            }
            None => FetchResult::NotFound,
        }
    }

    fn sentinel(&self, input: &InputRow) -> Option<Record> {
        Some(
            Record::not_found(input.id.clone())
                .with("lat", FieldValue::Number(SENTINEL_COORDINATE))
                .with("long", FieldValue::Number(SENTINEL_COORDINATE))
                .with("formatted_address", FieldValue::Null),
        )
    }

    fn credential(&self) -> Option<&str> {
        Some(self.builder.api_key())
    }
}
