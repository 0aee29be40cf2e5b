use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::tempdir;
use UrbanFetch::config::job::SourceConfig;
use UrbanFetch::config::{JobConfig, TableFormat};
use UrbanFetch::data_model::{FieldValue, HttpResponse, Record, RowStatus};
use UrbanFetch::error::FetchError;
use UrbanFetch::pipeline::accumulator::CheckpointManifest;
use UrbanFetch::pipeline::readers::read_table;
use UrbanFetch::pipeline::sources::{
    CensusSource, GeocodeSource, OpenDataSource, Source, StreetviewImageSource,
    StreetviewMetadataSource,
};
use UrbanFetch::JobRunner;

mod common;
use common::{status_only, write_file, ScriptedTransport};

fn job(yaml: &str) -> JobConfig {
    let config: JobConfig = serde_yaml::from_str(yaml).expect("valid job yaml");
    config.validate().expect("job validates");
    config
}

fn build_source(config: &JobConfig) -> Box<dyn Source> {
    match &config.source {
        SourceConfig::Geocode(params) => Box::new(GeocodeSource::new(params, "k".to_string())),
        SourceConfig::StreetviewMetadata(params) => {
            Box::new(StreetviewMetadataSource::new(params, "k".to_string()).unwrap())
        }
        SourceConfig::StreetviewImages(params) => {
            Box::new(StreetviewImageSource::new(params, "k".to_string()).unwrap())
        }
        SourceConfig::Census(params) => {
            Box::new(CensusSource::new(params, "k".to_string()).unwrap())
        }
        SourceConfig::OpenData(params) => Box::new(OpenDataSource::new(params, None).unwrap()),
    }
}

fn runner(config: &JobConfig, transport: &Arc<ScriptedTransport>) -> JobRunner {
    JobRunner::new(config.clone(), build_source(config), transport.clone())
}

fn read_output(config: &JobConfig) -> Vec<Record> {
    let source = build_source(config);
    let path = Path::new(&config.output.path);
    let format = config.output.resolved_format().unwrap();
    read_table(path, format, &source.columns()).expect("output readable")
}

fn sorted_output(config: &JobConfig) -> Vec<Record> {
    let mut records = read_output(config);
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}

fn manifest(config: &JobConfig) -> CheckpointManifest {
    CheckpointManifest::load(Path::new(&config.output.manifest_path()))
        .unwrap()
        .expect("manifest written")
}

fn find<'a>(records: &'a [Record], id: &str) -> &'a Record {
    records
        .iter()
        .find(|r| r.id == id)
        .unwrap_or_else(|| panic!("no row with id {}", id))
}

// --- Geocode -----------------------------------------------------------------

fn geocode_transport() -> Arc<ScriptedTransport> {
    Arc::new(ScriptedTransport::new(|request, _| {
        let body = match request.param("address") {
            Some("1 Main St Chicago IL") => json!({
                "status": "OK",
                "results": [{"geometry": {"location": {"lat": 41.88, "lng": -87.63}},
                             "formatted_address": "1 Main St, Chicago, IL"}]
            }),
            Some("Springfield IL") => json!({
                "status": "OK",
                "results": [{"geometry": {"location": {"lat": 39.78, "lng": -89.65}}}]
            }),
            _ => json!({"status": "ZERO_RESULTS", "results": []}),
        };
        Ok(HttpResponse::json(200, &body))
    }))
}

fn geocode_job(dir: &Path, extra: &str) -> JobConfig {
    let input = dir.join("addresses.csv");
    write_file(
        &input,
        "hash,Address,City,State\n\
         h1,1 Main St,Chicago,IL\n\
         h2,999 Unknown Rd,Springfield,IL\n\
         h3,1 Nowhere,Atlantis,ZZ\n\
         h4,,Springfield,IL\n",
    );
    job(&format!(
        r#"
source:
  type: Geocode
input:
  path: {input}
  id_column: hash
output:
  path: {output}
retry:
  max_attempts: 1
{extra}
"#,
        input = input.display(),
        output = dir.join("geocoded.parquet").display(),
        extra = extra,
    ))
}

#[test]
fn test_geocode_run_with_fallback_and_sentinel() {
    let dir = tempdir().unwrap();
    let config = geocode_job(
        dir.path(),
        "batching:\n  batch_size: 2\n  superbatch_size: 1\n  pool_size: 2",
    );
    let transport = geocode_transport();

    let summary = runner(&config, &transport).run().expect("run succeeds");

    assert_eq!(summary.inputs_total, 4);
    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.superbatches_run, 2);
    assert_eq!(summary.output_rows, 4);
    assert!(!summary.stopped_early);

    let records = read_output(&config);
    assert_eq!(records.len(), 4);
    assert_eq!(find(&records, "h1").get("lat"), Some(&FieldValue::Number(41.88)));
    assert_eq!(find(&records, "h2").get("lat"), Some(&FieldValue::Number(39.78)));
    assert_eq!(find(&records, "h4").get("long"), Some(&FieldValue::Number(-89.65)));
    let missing = find(&records, "h3");
    assert_eq!(missing.status, RowStatus::NotFound);
    assert_eq!(missing.get("lat"), Some(&FieldValue::Number(-999.0)));
    assert_eq!(missing.get("long"), Some(&FieldValue::Number(-999.0)));

    let manifest = manifest(&config);
    assert_eq!(manifest.source, "Geocode");
    assert_eq!(manifest.resolved_inputs.len(), 4);
    assert!(manifest.failed_inputs.is_empty());
    assert_eq!(manifest.superbatches_flushed, 2);
}

#[test]
fn test_rerun_fetches_nothing_new() {
    let dir = tempdir().unwrap();
    let config = geocode_job(dir.path(), "");
    let transport = geocode_transport();

    runner(&config, &transport).run().unwrap();
    let first_calls = transport.calls();
    let first_output = read_output(&config);

    let summary = runner(&config, &transport).run().unwrap();

    assert_eq!(transport.calls(), first_calls);
    assert_eq!(summary.inputs_already_resolved, 4);
    assert_eq!(summary.fetched + summary.not_found, 0);
    assert_eq!(read_output(&config), first_output);
}

#[test]
fn test_no_resume_starts_over() {
    let dir = tempdir().unwrap();
    let config = geocode_job(dir.path(), "");
    let transport = geocode_transport();
    runner(&config, &transport).run().unwrap();
    let first_calls = transport.calls();

    let mut fresh = config.clone();
    fresh.batching.resume = false;
    let summary = runner(&fresh, &transport).run().unwrap();

    assert_eq!(summary.inputs_already_resolved, 0);
    assert_eq!(transport.calls(), first_calls * 2);
    assert_eq!(read_output(&config).len(), 4);
}

#[test]
fn test_stop_after_max_superbatches_then_resume() {
    let dir = tempdir().unwrap();
    let config = geocode_job(
        dir.path(),
        "batching:\n  batch_size: 1\n  superbatch_size: 1\n  max_superbatches: 1",
    );
    let transport = geocode_transport();

    let partial = runner(&config, &transport).run().unwrap();
    assert!(partial.stopped_early);
    assert_eq!(partial.superbatches_run, 1);
    assert_eq!(read_output(&config).len(), 1);
    assert_eq!(manifest(&config).resolved_inputs.len(), 1);

    let mut rest = config.clone();
    rest.batching.max_superbatches = None;
    let summary = runner(&rest, &transport).run().unwrap();

    assert!(!summary.stopped_early);
    assert_eq!(summary.inputs_already_resolved, 1);
    assert_eq!(summary.superbatches_run, 3);

    let uninterrupted_dir = tempdir().unwrap();
    let uninterrupted = geocode_job(
        uninterrupted_dir.path(),
        "batching:\n  batch_size: 1\n  superbatch_size: 1",
    );
    runner(&uninterrupted, &geocode_transport()).run().unwrap();

    let resumed = sorted_output(&config);
    assert_eq!(resumed.len(), 4);
    assert_eq!(resumed, sorted_output(&uninterrupted));
    assert_eq!(
        manifest(&config).resolved_inputs,
        manifest(&uninterrupted).resolved_inputs
    );
}

#[test]
fn test_existing_output_without_manifest_counts_as_done() {
    let dir = tempdir().unwrap();
    let config = geocode_job(dir.path(), "");
    let transport = geocode_transport();
    runner(&config, &transport).run().unwrap();
    fs::remove_file(config.output.manifest_path()).unwrap();
    let calls = transport.calls();

    let summary = runner(&config, &transport).run().unwrap();

    assert_eq!(summary.inputs_already_resolved, 4);
    assert_eq!(transport.calls(), calls);
}

#[test]
fn test_duplicate_input_ids_are_fetched_once() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("addresses.csv");
    write_file(
        &input,
        "Address,City,State\n1 Main St,Chicago,IL\n1 Main St,Chicago,IL\n",
    );
    let config = job(&format!(
        r#"
source:
  type: Geocode
input:
  path: {}
output:
  path: {}
"#,
        input.display(),
        dir.path().join("geocoded.csv").display(),
    ));
    let transport = geocode_transport();

    let summary = runner(&config, &transport).run().unwrap();

    assert_eq!(summary.inputs_total, 1);
    assert_eq!(transport.calls(), 1);
    let records = read_output(&config);
    assert_eq!(records.len(), 1);
    // Without an id column the id is the joined address.
    assert_eq!(records[0].id, "1 Main St Chicago IL");
}

#[test]
fn test_abort_checkpoints_and_failed_rows_retry() {
    let dir = tempdir().unwrap();
    let config = geocode_job(
        dir.path(),
        "batching:\n  batch_size: 2\n  superbatch_size: 1\n  pool_size: 1\n  max_consecutive_fatal: 2",
    );
    let denied = Arc::new(ScriptedTransport::new(|_, _| Ok(status_only(403))));

    let result = runner(&config, &denied).run();

    match result {
        Err(FetchError::Aborted { consecutive, .. }) => assert!(consecutive >= 2),
        other => panic!("Expected Aborted, got {:?}", other),
    }
    assert_eq!(denied.calls(), 2);
    let after_abort = manifest(&config);
    assert_eq!(after_abort.failed_inputs.len(), 2);
    assert!(after_abort.resolved_inputs.is_empty());
    assert!(after_abort.failed_inputs["h1"].starts_with("fatal"));

    let transport = geocode_transport();
    let summary = runner(&config, &transport).run().unwrap();

    assert_eq!(summary.inputs_already_resolved, 0);
    assert_eq!(summary.fetched + summary.not_found, 4);
    let recovered = manifest(&config);
    assert!(recovered.failed_inputs.is_empty());
    assert_eq!(recovered.resolved_inputs.len(), 4);
}

#[test]
fn test_transient_failures_stay_unresolved() {
    let dir = tempdir().unwrap();
    let config = geocode_job(dir.path(), "");
    let throttled = Arc::new(ScriptedTransport::new(|_, _| Ok(status_only(429))));

    let summary = runner(&config, &throttled).run().unwrap();

    assert_eq!(summary.failed, 4);
    assert_eq!(summary.failed_inputs_total, 4);
    assert_eq!(summary.output_rows, 0);
    let manifest = manifest(&config);
    assert!(manifest.failed_inputs["h2"].starts_with("transient"));
}

// --- Street View -------------------------------------------------------------

#[test]
fn test_streetview_images_saved_next_to_table() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("metadata.csv");
    write_file(
        &input,
        "id,latitude,longitude,heading,status\n\
         p1,41.88,-87.63,90,ok\n\
         p2,41.89,-87.64,180,ok\n\
         p3,41.90,-87.65,0,not_found\n",
    );
    let images = dir.path().join("images");
    let config = job(&format!(
        r#"
source:
  type: StreetviewImages
  heading_column: heading
  status_column: status
input:
  path: {}
  id_column: id
output:
  path: {}
  images_dir: {}
"#,
        input.display(),
        dir.path().join("images.csv").display(),
        images.display(),
    ));
    let transport = Arc::new(ScriptedTransport::new(|request, _| {
        if request.endpoint().ends_with("/metadata") {
            return Ok(HttpResponse::json(
                200,
                &json!({"status": "OK", "pano_id": "pano", "date": "2020-01"}),
            ));
        }
        if request.param("location") == Some("41.89,-87.64") {
            return Ok(status_only(404));
        }
        Ok(HttpResponse {
            status: 200,
            content_type: Some("image/jpeg".to_string()),
            body: b"jpegbytes".to_vec(),
        })
    }));

    let summary = runner(&config, &transport).run().unwrap();

    assert_eq!(summary.inputs_total, 2);
    assert_eq!(summary.inputs_rejected, 1);
    assert_eq!(summary.fetched, 2);

    let saved = images.join("p1.jpg");
    assert_eq!(fs::read(&saved).unwrap(), b"jpegbytes");
    assert!(!images.join("p2.jpg").exists());

    let records = read_output(&config);
    let p1 = find(&records, "p1");
    assert_eq!(p1.get("image_status"), Some(&FieldValue::text("saved")));
    assert_eq!(
        p1.get("image_path"),
        Some(&FieldValue::text(saved.display().to_string()))
    );
    let p2 = find(&records, "p2");
    assert_eq!(p2.get("image_status"), Some(&FieldValue::text("missing")));
    assert_eq!(p2.get("image_path"), Some(&FieldValue::Null));
}

#[test]
fn test_image_rows_keep_their_own_files_and_missing_panoramas() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("points.csv");
    write_file(
        &input,
        "id,latitude,longitude,heading\n\
         a/b,41.1,-87.1,90\n\
         a_b,41.2,-87.2,90\n\
         z1,41.3,-87.3,90\n",
    );
    let images = dir.path().join("img");
    let config = job(&format!(
        r#"
source:
  type: StreetviewImages
  heading_column: heading
input:
  path: {}
  id_column: id
output:
  path: {}
  images_dir: {}
"#,
        input.display(),
        dir.path().join("images.parquet").display(),
        images.display(),
    ));
    let transport = Arc::new(ScriptedTransport::new(|request, _| {
        let location = request.param("location").unwrap_or("").to_string();
        if request.endpoint().ends_with("/metadata") {
            let body = if location == "41.3,-87.3" {
                json!({"status": "ZERO_RESULTS"})
            } else {
                json!({"status": "OK", "pano_id": "pano", "date": "2020-01"})
            };
            return Ok(HttpResponse::json(200, &body));
        }
        Ok(HttpResponse {
            status: 200,
            content_type: Some("image/jpeg".to_string()),
            body: location.into_bytes(),
        })
    }));

    let summary = runner(&config, &transport).run().unwrap();

    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.not_found, 1);

    let records = read_output(&config);
    assert_eq!(records.len(), 3);
    let path_of = |id: &str| match find(&records, id).get("image_path") {
        Some(FieldValue::Text(path)) => path.clone(),
        other => panic!("{} has no image path: {:?}", id, other),
    };
    let slash = path_of("a/b");
    let underscore = path_of("a_b");
    assert_ne!(slash, underscore);
    assert_eq!(fs::read(&slash).unwrap(), b"41.1,-87.1");
    assert_eq!(fs::read(&underscore).unwrap(), b"41.2,-87.2");
    assert_eq!(fs::read_dir(&images).unwrap().count(), 2);

    let missing = find(&records, "z1");
    assert_eq!(missing.status, RowStatus::NotFound);
    assert_eq!(missing.get("image_status"), Some(&FieldValue::text("missing")));
    assert_eq!(missing.get("image_path"), Some(&FieldValue::Null));
    assert!(manifest(&config).resolved_inputs.contains("z1"));
}

#[test]
fn test_fanout_payloads_written() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("points.csv");
    let mut csv = String::from("id,latitude,longitude\n");
    for i in 0..7 {
        csv.push_str(&format!("p{},41.{},-87.{}\n", i, i, i));
    }
    write_file(&input, &csv);
    let config = job(&format!(
        r#"
source:
  type: StreetviewMetadata
input:
  path: {}
  id_column: id
output:
  path: {}
fanout:
  worker_resource: arn:aws:lambda:us-east-1:123:function:fetch
  max_concurrency: 4
  superbatches: 2
  batches_per_invocation: 2
"#,
        input.display(),
        dir.path().join("metadata.csv").display(),
    ));
    let transport = Arc::new(ScriptedTransport::new(|_, _| Ok(status_only(500))));
    let out = dir.path().join("fanout");

    let executions = runner(&config, &transport).emit_fanout(&out).unwrap();

    assert_eq!(executions, 2);
    assert_eq!(transport.calls(), 0);

    let definition: Value =
        serde_json::from_str(&fs::read_to_string(out.join("definition.json")).unwrap()).unwrap();
    let rendered = definition.to_string();
    assert!(rendered.contains("arn:aws:lambda:us-east-1:123:function:fetch"));
    assert!(rendered.contains("\"MaxConcurrency\":4"));

    let mut ids = Vec::new();
    for index in 0..executions {
        let path = out.join(format!("execution_{:04}.json", index));
        let execution: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        for batch in execution["batches"].as_array().unwrap() {
            for task in batch.as_array().unwrap() {
                assert_eq!(task["API_KEY"], "k");
                assert!(task["heading"].is_string());
                ids.push(task["ID"].as_str().unwrap().to_string());
            }
        }
    }
    let expected: Vec<String> = (0..7).map(|i| format!("p{}", i)).collect();
    assert_eq!(ids, expected);
}

// --- Census ------------------------------------------------------------------

fn census_job(dir: &Path, extra: &str) -> JobConfig {
    job(&format!(
        r#"
source:
  type: Census
  year: 2019
  geography: county
  state: "17"
  tables:
    B01001_001E: total_pop
    B03002_003E: white_pop
  derived:
    - name: pct_white
      numerators: [white_pop]
      denominator: total_pop
output:
  path: {}
batching:
  batch_size: 1
  superbatch_size: 1
{}
"#,
        dir.join("census.csv").display(),
        extra,
    ))
}

fn census_transport() -> Arc<ScriptedTransport> {
    Arc::new(ScriptedTransport::new(|request, _| {
        assert_eq!(request.param("in"), Some("state:17"));
        let body = match request.param("get") {
            Some(get) if get.contains("B01001_001E") => json!([
                ["NAME", "B01001_001E", "state", "county"],
                ["Cook County", "5000", "17", "031"],
                ["Lake County", "0", "17", "097"]
            ]),
            _ => json!([
                ["NAME", "B03002_003E", "state", "county"],
                ["Cook County", "2000", "17", "031"],
                ["Lake County", "10", "17", "097"]
            ]),
        };
        Ok(HttpResponse::json(200, &body))
    }))
}

#[test]
fn test_census_tables_merge_by_geoid_with_derived_ratio() {
    let dir = tempdir().unwrap();
    let config = census_job(dir.path(), "");
    let transport = census_transport();

    let summary = runner(&config, &transport).run().unwrap();

    assert_eq!(summary.inputs_total, 2);
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.output_rows, 2);

    let records = read_output(&config);
    let cook = find(&records, "17031");
    assert_eq!(cook.get("total_pop"), Some(&FieldValue::Number(5000.0)));
    assert_eq!(cook.get("white_pop"), Some(&FieldValue::Number(2000.0)));
    assert_eq!(cook.get("pct_white"), Some(&FieldValue::Number(40.0)));
    // Zero denominator leaves the ratio empty.
    assert_eq!(find(&records, "17097").get("pct_white"), Some(&FieldValue::Null));
}

#[test]
fn test_census_resume_matches_uninterrupted_run() {
    let dir = tempdir().unwrap();
    let config = census_job(dir.path(), "  max_superbatches: 1");
    let transport = census_transport();

    let partial = runner(&config, &transport).run().unwrap();
    assert!(partial.stopped_early);
    let halfway = read_output(&config);
    assert_eq!(halfway.len(), 2);
    assert!(halfway
        .iter()
        .all(|r| r.get("pct_white") == Some(&FieldValue::Null)));

    let mut rest = config.clone();
    rest.batching.max_superbatches = None;
    let summary = runner(&rest, &transport).run().unwrap();
    assert!(!summary.stopped_early);
    assert_eq!(summary.inputs_already_resolved, 1);
    assert_eq!(transport.calls(), 2);

    let uninterrupted_dir = tempdir().unwrap();
    let uninterrupted = census_job(uninterrupted_dir.path(), "");
    runner(&uninterrupted, &census_transport()).run().unwrap();

    let resumed = sorted_output(&config);
    assert_eq!(resumed, sorted_output(&uninterrupted));
    assert_eq!(
        find(&resumed, "17031").get("pct_white"),
        Some(&FieldValue::Number(40.0))
    );
}

// --- Open Data ---------------------------------------------------------------

#[test]
fn test_open_data_pages_filtered_and_merged() {
    let dir = tempdir().unwrap();
    let mapping = dir.path().join("classes.json");
    write_file(&mapping, r#"{"0110": "violent", "0486": "violent", "0820": "property"}"#);
    let config = job(&format!(
        r#"
source:
  type: OpenData
  base_url: https://data.example.org
  dataset: abcd-1234
  select: [id, iucr, primary_type]
  id_field: id
  page_size: 2
  page_count: 3
  exclude:
    - column: primary_type
      values: [NON-CRIMINAL]
  classification:
    column: iucr
    mapping_path: {}
    output_column: crime_class
output:
  path: {}
"#,
        mapping.display(),
        dir.path().join("crimes.parquet").display(),
    ));
    let transport = Arc::new(ScriptedTransport::new(|request, _| {
        let query = request.param("$query").unwrap_or("");
        let body = if query.ends_with("OFFSET 0") {
            json!([
                {"id": "1", "iucr": "0110", "primary_type": "HOMICIDE"},
                {"id": "2", "iucr": "5000", "primary_type": "NON-CRIMINAL"}
            ])
        } else if query.ends_with("OFFSET 2") {
            json!([
                {"id": "3", "iucr": "0820", "primary_type": "THEFT"},
                {"id": "4", "iucr": "9999", "primary_type": "OTHER"},
                {"iucr": "0486", "primary_type": "BATTERY"}
            ])
        } else {
            json!([])
        };
        Ok(HttpResponse::json(200, &body))
    }));

    let summary = runner(&config, &transport).run().unwrap();

    assert_eq!(summary.inputs_total, 3);
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.not_found, 1);
    assert_eq!(transport.calls(), 3);

    let records = read_output(&config);
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "3"]);
    assert_eq!(find(&records, "1").get("crime_class"), Some(&FieldValue::text("violent")));
    assert_eq!(find(&records, "3").get("crime_class"), Some(&FieldValue::text("property")));

    let config_format = config.output.resolved_format().unwrap();
    assert_eq!(config_format, TableFormat::Parquet);
}

#[test]
fn test_open_data_missing_dataset_aborts() {
    let dir = tempdir().unwrap();
    let config = job(&format!(
        r#"
source:
  type: OpenData
  dataset: gone-0000
  select: [id]
  id_field: id
  page_count: 5
output:
  path: {}
batching:
  batch_size: 1
  superbatch_size: 1
  pool_size: 1
  max_consecutive_fatal: 3
"#,
        dir.path().join("gone.csv").display(),
    ));
    let transport = Arc::new(ScriptedTransport::new(|_, _| Ok(status_only(404))));

    let result = runner(&config, &transport).run();

    assert!(matches!(result, Err(FetchError::Aborted { .. })));
    assert_eq!(transport.calls(), 3);
    assert_eq!(manifest(&config).failed_inputs.len(), 3);
}
