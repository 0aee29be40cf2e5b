// src/pipeline/sources/streetview.rs

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::config::job::{ImageSize, StreetviewParams};
use crate::data_model::{
    Attachment, Column, FetchRequest, FetchResult, FieldValue, HttpResponse, InputRow, Payload,
    Record, RowStatus,
};
use crate::error::{FetchError, Result};
use crate::pipeline::sources::{classify_google_status, Source};
use crate::utils::common::fnv1a;

pub const METADATA_URL: &str = "https://maps.googleapis.com/maps/api/streetview/metadata";
pub const IMAGE_URL: &str = "https://maps.googleapis.com/maps/api/streetview";

pub const MAX_IMAGE_DIMENSION: u32 = 640;
pub const MAX_FOV: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Default,
    Outdoor,
}

impl ImageSource {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "default" => Ok(ImageSource::Default),
            "outdoor" => Ok(ImageSource::Outdoor),
            other => Err(FetchError::invalid(
                "source",
                format!("expected 'default' or 'outdoor', got '{}'", other),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Default => "default",
            ImageSource::Outdoor => "outdoor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Result<Self> {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(FetchError::invalid(
                "latitude",
                format!("{} is outside [-90, 90]", lat),
            ));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(FetchError::invalid(
                "longitude",
                format!("{} is outside [-180, 180]", lng),
            ));
        }
        Ok(Location { lat, lng })
    }

    fn as_param(&self) -> String {
        format!("{},{}", self.lat, self.lng)
    }
}

/// Builds Street View metadata and image requests. Every numeric parameter is range-checked
/// before a request exists.
#[derive(Debug, Clone)]
pub struct StreetviewRequestBuilder {
    metadata_endpoint: String,
    image_endpoint: String,
    api_key: String,
    size: ImageSize,
    fov: Option<f64>,
    pitch: Option<f64>,
    radius: Option<i64>,
    source: ImageSource,
}

impl StreetviewRequestBuilder {
    pub fn new(api_key: impl Into<String>) -> Self {
        StreetviewRequestBuilder {
            metadata_endpoint: METADATA_URL.to_string(),
            image_endpoint: IMAGE_URL.to_string(),
            api_key: api_key.into(),
            size: ImageSize::default(),
            fov: None,
            pitch: None,
            radius: None,
            source: ImageSource::Outdoor,
        }
    }

    pub fn from_params(params: &StreetviewParams, api_key: impl Into<String>) -> Result<Self> {
        let builder = StreetviewRequestBuilder {
            metadata_endpoint: params
                .metadata_endpoint
                .clone()
                .unwrap_or_else(|| METADATA_URL.to_string()),
            image_endpoint: params
                .image_endpoint
                .clone()
                .unwrap_or_else(|| IMAGE_URL.to_string()),
            api_key: api_key.into(),
            size: params.size,
            fov: params.fov,
            pitch: params.pitch,
            radius: params.radius,
            source: ImageSource::parse(&params.source)?,
        };
        builder.validate()?;
        Ok(builder)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("width", self.size.width), ("height", self.size.height)] {
            if value == 0 || value > MAX_IMAGE_DIMENSION {
                return Err(FetchError::invalid(
                    "size",
                    format!(
                        "{} {} is outside [1, {}]",
                        name, value, MAX_IMAGE_DIMENSION
                    ),
                ));
            }
        }
        if let Some(fov) = self.fov {
            if !(0.0..=MAX_FOV).contains(&fov) {
                return Err(FetchError::invalid(
                    "fov",
                    format!("{} is outside [0, {}]", fov, MAX_FOV),
                ));
            }
        }
        if let Some(pitch) = self.pitch {
            if !(-90.0..=90.0).contains(&pitch) {
                return Err(FetchError::invalid(
                    "pitch",
                    format!("{} is outside [-90, 90]", pitch),
                ));
            }
        }
        if let Some(radius) = self.radius {
            if radius < 0 {
                return Err(FetchError::invalid(
                    "radius",
                    format!("{} must not be negative", radius),
                ));
            }
        }
        Ok(())
    }

    pub fn image_endpoint(&self) -> &str {
        &self.image_endpoint
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn metadata_request(&self, location: Location, heading: f64) -> Result<FetchRequest> {
        Ok(FetchRequest::new(
            self.metadata_endpoint.clone(),
            self.params(location, heading)?,
        ))
    }

    pub fn image_request(&self, location: Location, heading: f64) -> Result<FetchRequest> {
        Ok(FetchRequest::new(
            self.image_endpoint.clone(),
            self.params(location, heading)?,
        ))
    }

    fn params(&self, location: Location, heading: f64) -> Result<Vec<(String, String)>> {
        if !(0.0..=360.0).contains(&heading) {
            return Err(FetchError::invalid(
                "heading",
                format!("{} is outside [0, 360]", heading),
            ));
        }
        let mut params = vec![
            (
                "size".to_string(),
                format!("{}x{}", self.size.width, self.size.height),
            ),
            ("heading".to_string(), heading.to_string()),
            ("source".to_string(), self.source.as_str().to_string()),
            ("return_error_code".to_string(), "true".to_string()),
        ];
        if let Some(fov) = self.fov {
            params.push(("fov".to_string(), fov.to_string()));
        }
        if let Some(pitch) = self.pitch {
            params.push(("pitch".to_string(), pitch.to_string()));
        }
        if let Some(radius) = self.radius {
            params.push(("radius".to_string(), radius.to_string()));
        }
        params.push(("key".to_string(), self.api_key.clone()));
        params.push(("location".to_string(), location.as_param()));
        Ok(params)
    }
}

/// Heading in whole degrees [0, 360), stable for a given seed and row id.
pub fn heading_for(seed: u64, id: &str) -> f64 {
    let mut rng = StdRng::seed_from_u64(seed ^ fnv1a(id.as_bytes()));
    rng.gen_range(0..360) as f64
}

#[derive(Deserialize, Debug)]
struct MetadataResponse {
    status: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    pano_id: Option<String>,
    #[serde(default)]
    location: Option<PanoLocation>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct PanoLocation {
    lat: f64,
    lng: f64,
}

fn optional_text(value: Option<String>) -> FieldValue {
    value.map(FieldValue::Text).unwrap_or(FieldValue::Null)
}

/// Row columns shared by the metadata and image sources.
struct PointColumns {
    latitude: String,
    longitude: String,
    heading: Option<String>,
    heading_seed: u64,
}

impl PointColumns {
    fn from_params(params: &StreetviewParams) -> Self {
        PointColumns {
            latitude: params.latitude_column.clone(),
            longitude: params.longitude_column.clone(),
            heading: params.heading_column.clone(),
            heading_seed: params.heading_seed,
        }
    }

    fn location(&self, input: &InputRow) -> Result<Location> {
        Location::new(
            input.parse_f64(&self.latitude)?,
            input.parse_f64(&self.longitude)?,
        )
    }

    fn heading(&self, input: &InputRow) -> Result<f64> {
        match &self.heading {
            Some(column) => input.parse_f64(column),
            None => Ok(heading_for(self.heading_seed, &input.id)),
        }
    }
}

fn interpret_metadata(input: &InputRow, heading: f64, response: &HttpResponse) -> FetchResult {
    let parsed: MetadataResponse = match serde_json::from_slice(&response.body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return FetchResult::FatalError(format!(
                "Malformed Street View metadata response: {}",
                e
            ))
        }
    };
    if let Some(result) = classify_google_status(&parsed.status, parsed.error_message.as_deref()) {
        return result;
    }
    let (pano_lat, pano_lng) = match parsed.location {
        Some(location) => (
            FieldValue::Number(location.lat),
            FieldValue::Number(location.lng),
        ),
        None => (FieldValue::Null, FieldValue::Null),
    };
    FetchResult::Success(Payload::single(
        Record::new(input.id.clone())
            .with("heading", FieldValue::Number(heading))
            .with("date", optional_text(parsed.date))
            .with("pano_id", optional_text(parsed.pano_id))
            .with("pano_lat", pano_lat)
            .with("pano_lng", pano_lng),
    ))
}

/// Which panorama (if any) exists near each point.
pub struct StreetviewMetadataSource {
    builder: StreetviewRequestBuilder,
    points: PointColumns,
}

impl StreetviewMetadataSource {
    pub fn new(params: &StreetviewParams, api_key: String) -> Result<Self> {
        Ok(StreetviewMetadataSource {
            builder: StreetviewRequestBuilder::from_params(params, api_key)?,
            points: PointColumns::from_params(params),
        })
    }
}

impl Source for StreetviewMetadataSource {
    fn name(&self) -> &'static str {
        "StreetviewMetadata"
    }

    fn columns(&self) -> Vec<Column> {
        vec![
            Column::float("heading"),
            Column::utf8("date"),
            Column::utf8("pano_id"),
            Column::float("pano_lat"),
            Column::float("pano_lng"),
        ]
    }

    fn plan(&self, input: &InputRow) -> Result<Vec<FetchRequest>> {
        let location = self.points.location(input)?;
        let heading = self.points.heading(input)?;
        Ok(vec![self
            .builder
            .metadata_request(location, heading)?
            .with_correlation_id(input.id.clone())])
    }

    fn interpret(
        &self,
        input: &InputRow,
        request: &FetchRequest,
        response: &HttpResponse,
    ) -> FetchResult {
        let heading = request
            .param("heading")
            .and_then(|h| h.parse().ok())
            .unwrap_or(0.0);
        interpret_metadata(input, heading, response)
    }

    fn sentinel(&self, input: &InputRow) -> Option<Record> {
        Some(no_panorama_record(&self.points, input))
    }

    fn task_params(&self, input: &InputRow) -> Result<BTreeMap<String, String>> {
        task_params(&self.points, input)
    }

    fn credential(&self) -> Option<&str> {
        Some(self.builder.api_key())
    }
}

/// Metadata first; the image is requested only when a panorama exists.
pub struct StreetviewImageSource {
    builder: StreetviewRequestBuilder,
    points: PointColumns,
    status_column: Option<String>,
}

impl StreetviewImageSource {
    pub fn new(params: &StreetviewParams, api_key: String) -> Result<Self> {
        Ok(StreetviewImageSource {
            builder: StreetviewRequestBuilder::from_params(params, api_key)?,
            points: PointColumns::from_params(params),
            status_column: params.status_column.clone(),
        })
    }

    fn image_extension(content_type: Option<&str>) -> Option<&'static str> {
        match content_type.map(|ct| ct.split(';').next().unwrap_or("").trim()) {
            Some("image/jpeg") | Some("image/jpg") => Some("jpg"),
            Some("image/png") => Some("png"),
            _ => None,
        }
    }
}

impl Source for StreetviewImageSource {
    fn name(&self) -> &'static str {
        "StreetviewImages"
    }

    fn columns(&self) -> Vec<Column> {
        vec![
            Column::float("heading"),
            Column::utf8("date"),
            Column::utf8("pano_id"),
            Column::float("pano_lat"),
            Column::float("pano_lng"),
            Column::utf8("image_status"),
            Column::utf8("image_path"),
        ]
    }

    fn accepts(&self, input: &InputRow) -> bool {
        match &self.status_column {
            Some(column) => input.field_or_empty(column) == RowStatus::Ok.as_str(),
            None => true,
        }
    }

    fn plan(&self, input: &InputRow) -> Result<Vec<FetchRequest>> {
        let location = self.points.location(input)?;
        let heading = self.points.heading(input)?;
        Ok(vec![self
            .builder
            .metadata_request(location, heading)?
            .with_correlation_id(input.id.clone())])
    }

    fn interpret(
        &self,
        input: &InputRow,
        request: &FetchRequest,
        response: &HttpResponse,
    ) -> FetchResult {
        if request.endpoint() != self.builder.image_endpoint() {
            let heading = request
                .param("heading")
                .and_then(|h| h.parse().ok())
                .unwrap_or(0.0);
            return interpret_metadata(input, heading, response);
        }
        match Self::image_extension(response.content_type.as_deref()) {
            Some(extension) if !response.body.is_empty() => FetchResult::Success(Payload {
                records: Vec::new(),
                attachment: Some(Attachment {
                    extension: extension.to_string(),
                    bytes: response.body.clone(),
                }),
            }),
            _ => FetchResult::FatalError(format!(
                "Expected an image body, got content type {:?}",
                response.content_type
            )),
        }
    }

    fn follow_up(&self, input: &InputRow, first: &Payload) -> Option<FetchRequest> {
        let record = first.records.first()?;
        if record.status != RowStatus::Ok {
            return None;
        }
        let location = self.points.location(input).ok()?;
        let heading = record.get("heading").and_then(FieldValue::as_f64)?;
        self.builder
            .image_request(location, heading)
            .ok()
            .map(|request| request.with_correlation_id(input.id.clone()))
    }

    fn complete(&self, _input: &InputRow, mut first: Payload, second: FetchResult) -> FetchResult {
        match second {
            FetchResult::Success(image) => {
                first.attachment = image.attachment;
                for record in first.records.iter_mut() {
                    record.set("image_status", FieldValue::text("saved"));
                }
                FetchResult::Success(first)
            }
            FetchResult::NotFound => {
                for record in first.records.iter_mut() {
                    record.set("image_status", FieldValue::text("missing"));
                    record.set("image_path", FieldValue::Null);
                }
                FetchResult::Success(first)
            }
            error => error,
        }
    }

    fn sentinel(&self, input: &InputRow) -> Option<Record> {
        Some(
            no_panorama_record(&self.points, input)
                .with("image_status", FieldValue::text("missing"))
                .with("image_path", FieldValue::Null),
        )
    }

    fn task_params(&self, input: &InputRow) -> Result<BTreeMap<String, String>> {
        task_params(&self.points, input)
    }

    fn credential(&self) -> Option<&str> {
        Some(self.builder.api_key())
    }
}

fn no_panorama_record(points: &PointColumns, input: &InputRow) -> Record {
    let heading = points
        .heading(input)
        .map(FieldValue::Number)
        .unwrap_or(FieldValue::Null);
    Record::not_found(input.id.clone())
        .with("heading", heading)
        .with("date", FieldValue::Null)
        .with("pano_id", FieldValue::Null)
        .with("pano_lat", FieldValue::Null)
        .with("pano_lng", FieldValue::Null)
}

fn task_params(points: &PointColumns, input: &InputRow) -> Result<BTreeMap<String, String>> {
    let location = points.location(input)?;
    let heading = points.heading(input)?;
    let mut params = BTreeMap::new();
    params.insert("latitude".to_string(), location.lat.to_string());
    params.insert("longitude".to_string(), location.lng.to_string());
    params.insert("heading".to_string(), heading.to_string());
    Ok(params)
}
