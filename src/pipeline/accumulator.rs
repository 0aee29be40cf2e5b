// src/pipeline/accumulator.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{OutputConfig, TableFormat};
use crate::data_model::{Attachment, Column, FieldValue, Record, RowOutcome};
use crate::error::{FetchError, Result};
use crate::pipeline::readers::read_table;
use crate::pipeline::sources::Source;
use crate::pipeline::writers::base_writer::{persist, temp_file_beside};
use crate::pipeline::writers::write_table;
use crate::utils::common::fnv1a;
use crate::utils::prometheus_metrics::*;

/// In-memory rows keyed by id. Iteration is in id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    rows: BTreeMap<String, Record>,
}

impl ResultTable {
    pub fn new() -> Self {
        ResultTable::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.rows.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    /// Inserts unless the id is taken; returns whether it was inserted.
    pub fn insert_new(&mut self, record: Record) -> bool {
        if self.rows.contains_key(&record.id) {
            return false;
        }
        self.rows.insert(record.id.clone(), record);
        true
    }

    /// Field-wise merge into any existing row with the same id.
    pub fn merge(&mut self, record: Record) {
        match self.rows.get_mut(&record.id) {
            Some(existing) => existing.merge_from(record),
            None => {
                self.rows.insert(record.id.clone(), record);
            }
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.rows.values()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.rows.values_mut()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.rows.into_values().collect()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

impl FromIterator<Record> for ResultTable {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut table = ResultTable::new();
        for record in iter {
            table.merge(record);
        }
        table
    }
}

/// Progress persisted next to the output so a rerun can skip finished inputs.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CheckpointManifest {
    pub source: String,
    pub superbatches_flushed: u64,
    pub rows_flushed: usize,
    pub resolved_inputs: BTreeSet<String>,
    /// Input id to the last failure reason; these are retried on the next run.
    pub failed_inputs: BTreeMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CheckpointManifest {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let manifest = serde_json::from_str(&raw).map_err(|e| {
            FetchError::ConfigError(format!(
                "Failed to parse checkpoint manifest '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(manifest))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut temp = temp_file_beside(path)?;
        serde_json::to_writer_pretty(&mut temp, self)?;
        temp.flush()?;
        persist(temp, path)
    }
}

/// Totals reported when the run is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointStats {
    pub rows: usize,
    pub resolved_inputs: usize,
    pub failed_inputs: usize,
    pub superbatches_flushed: u64,
}

/// Buffers results and periodically merges them into the durable output.
///
/// Durable state moves in one order: table first, then manifest. A crash between the two
/// leaves rows whose inputs are not marked resolved; they are refetched and merged by id.
pub struct Checkpointer {
    source_name: String,
    columns: Vec<Column>,
    one_row_per_input: bool,
    output_path: PathBuf,
    format: TableFormat,
    manifest_path: PathBuf,
    images_dir: Option<PathBuf>,
    buffer: ResultTable,
    manifest: CheckpointManifest,
    pending_resolved: BTreeSet<String>,
    pending_failed: BTreeMap<String, String>,
}

impl Checkpointer {
    /// Opens the output for `source`, resuming from an existing checkpoint when `resume` is set.
    pub fn open(source: &dyn Source, output: &OutputConfig, resume: bool) -> Result<Self> {
        let output_path = PathBuf::from(&output.path);
        let manifest_path = PathBuf::from(output.manifest_path());
        let format = output.resolved_format()?;

        if !resume {
            for path in [&output_path, &manifest_path] {
                if path.exists() {
                    info!(path = %path.display(), "Removing previous output (resume disabled)");
                    fs::remove_file(path)?;
                }
            }
        }

        let mut checkpointer = Checkpointer {
            source_name: source.name().to_string(),
            columns: source.columns(),
            one_row_per_input: source.one_row_per_input(),
            output_path,
            format,
            manifest_path,
            images_dir: output.images_dir.as_ref().map(PathBuf::from),
            buffer: ResultTable::new(),
            manifest: CheckpointManifest {
                source: source.name().to_string(),
                ..CheckpointManifest::default()
            },
            pending_resolved: BTreeSet::new(),
            pending_failed: BTreeMap::new(),
        };

        if resume {
            checkpointer.restore()?;
        }
        if let Some(dir) = &checkpointer.images_dir {
            fs::create_dir_all(dir)?;
        }
        Ok(checkpointer)
    }

    fn restore(&mut self) -> Result<()> {
        match CheckpointManifest::load(&self.manifest_path)? {
            Some(manifest) => {
                if manifest.source != self.source_name {
                    return Err(FetchError::ConfigError(format!(
                        "Checkpoint '{}' belongs to a {} job, not {}",
                        self.manifest_path.display(),
                        manifest.source,
                        self.source_name
                    )));
                }
                info!(
                    resolved = manifest.resolved_inputs.len(),
                    failed = manifest.failed_inputs.len(),
                    superbatches = manifest.superbatches_flushed,
                    "Resuming from checkpoint"
                );
                self.manifest = manifest;
            }
            None if self.output_path.exists() && self.one_row_per_input => {
                // Output without a manifest: every row already written counts as resolved.
                let existing = self.read_durable()?;
                info!(
                    rows = existing.len(),
                    "No checkpoint manifest, treating existing output rows as resolved"
                );
                self.manifest.rows_flushed = existing.len();
                self.manifest.resolved_inputs =
                    existing.records().map(|r| r.id.clone()).collect();
            }
            None => {}
        }
        Ok(())
    }

    pub fn manifest(&self) -> &CheckpointManifest {
        &self.manifest
    }

    pub fn is_resolved(&self, input_id: &str) -> bool {
        self.manifest.resolved_inputs.contains(input_id) || self.pending_resolved.contains(input_id)
    }

    /// Number of buffered rows not yet flushed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn buffer_record(&mut self, record: Record) {
        if self.one_row_per_input {
            let id = record.id.clone();
            if !self.buffer.insert_new(record) {
                warn!(id = %id, "Duplicate output id, keeping the first record");
            }
        } else {
            self.buffer.merge(record);
        }
    }

    fn save_attachment(&self, input_id: &str, attachment: &Attachment) -> Result<Option<String>> {
        let dir = match &self.images_dir {
            Some(dir) => dir,
            None => return Ok(None),
        };
        let path = dir.join(format!("{}.{}", sanitize_file_stem(input_id), attachment.extension));
        let mut temp = temp_file_beside(&path)?;
        temp.write_all(&attachment.bytes)?;
        temp.flush()?;
        persist(temp, &path)?;
        IMAGES_SAVED_TOTAL.inc();
        Ok(Some(path.display().to_string()))
    }

    /// Buffers one row outcome. Nothing is durable until `flush`.
    pub fn record(&mut self, outcome: RowOutcome) -> Result<()> {
        match outcome {
            RowOutcome::Fetched { input_id, payload } => {
                let image_path = match &payload.attachment {
                    Some(attachment) => self.save_attachment(&input_id, attachment)?,
                    None => None,
                };
                for mut record in payload.records {
                    if let Some(path) = &image_path {
                        if record.id == input_id {
                            record.set("image_path", FieldValue::text(path.clone()));
                        }
                    }
                    self.buffer_record(record);
                }
                self.pending_failed.remove(&input_id);
                self.pending_resolved.insert(input_id);
            }
            RowOutcome::NotFound { input_id, sentinel } => {
                if let Some(record) = sentinel {
                    self.buffer_record(record);
                }
                self.pending_failed.remove(&input_id);
                self.pending_resolved.insert(input_id);
            }
            RowOutcome::Failed {
                input_id,
                reason,
                kind,
            } => {
                self.pending_failed
                    .insert(input_id, format!("{}: {}", kind.as_str(), reason));
            }
            RowOutcome::Skipped { .. } => {}
        }
        Ok(())
    }

    fn read_durable(&self) -> Result<ResultTable> {
        if !self.output_path.exists() {
            return Ok(ResultTable::new());
        }
        Ok(read_table(&self.output_path, self.format, &self.columns)?
            .into_iter()
            .collect())
    }

    /// Merges buffered rows into the durable output and advances the manifest.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() && self.pending_resolved.is_empty() && self.pending_failed.is_empty()
        {
            debug!("Nothing to flush");
            return Ok(());
        }

        let mut table = self.read_durable()?;
        let buffered = std::mem::take(&mut self.buffer);
        for record in buffered.into_records() {
            if self.one_row_per_input {
                let id = record.id.clone();
                if !table.insert_new(record) {
                    warn!(id = %id, "Row already in output, keeping the existing record");
                }
            } else {
                table.merge(record);
            }
        }
        let rows = table.len();
        write_table(
            &self.output_path,
            self.format,
            &self.columns,
            &table.into_records(),
        )?;

        for id in std::mem::take(&mut self.pending_resolved) {
            self.manifest.failed_inputs.remove(&id);
            self.manifest.resolved_inputs.insert(id);
        }
        for (id, reason) in std::mem::take(&mut self.pending_failed) {
            self.manifest.failed_inputs.insert(id, reason);
        }
        self.manifest.superbatches_flushed += 1;
        self.manifest.rows_flushed = rows;
        self.manifest.updated_at = Some(Utc::now());
        self.manifest.save(&self.manifest_path)?;

        CHECKPOINT_FLUSHES_TOTAL.inc();
        info!(
            rows,
            resolved = self.manifest.resolved_inputs.len(),
            failed = self.manifest.failed_inputs.len(),
            output = %self.output_path.display(),
            "Checkpoint flushed"
        );
        Ok(())
    }

    /// Final flush, then derived columns over the whole table.
    pub fn finish(mut self, source: &dyn Source) -> Result<CheckpointStats> {
        self.flush()?;
        if source.has_derived_columns() && self.output_path.exists() {
            let mut table = self.read_durable()?;
            for record in table.records_mut() {
                source.derive(record);
            }
            write_table(
                &self.output_path,
                self.format,
                &self.columns,
                &table.into_records(),
            )?;
            debug!("Derived columns computed");
        }
        Ok(self.stats())
    }

    pub fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            rows: self.manifest.rows_flushed,
            resolved_inputs: self.manifest.resolved_inputs.len(),
            failed_inputs: self.manifest.failed_inputs.len(),
            superbatches_flushed: self.manifest.superbatches_flushed,
        }
    }
}

/// Maps ids to distinct file stems. Ids already made of `[A-Za-z0-9._-]` are kept as is;
/// anything else is cleaned and tagged with `~` plus a hash of the raw id, so two ids never
/// share a file.
fn sanitize_file_stem(id: &str) -> String {
    let clean: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if clean == id {
        clean
    } else {
        format!("{}~{:016x}", clean, fnv1a(id.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{FailureKind, Payload, RowStatus};
    use std::collections::HashSet;

    #[test]
    fn table_merges_by_id_in_sorted_order() {
        let table: ResultTable = vec![
            Record::new("b").with("x", FieldValue::Number(1.0)),
            Record::new("a").with("x", FieldValue::Number(2.0)),
            Record::new("b").with("y", FieldValue::Number(3.0)),
        ]
        .into_iter()
        .collect();
        let ids: Vec<&str> = table.records().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(table.get("b").unwrap().get("y"), Some(&FieldValue::Number(3.0)));
        assert_eq!(table.get("b").unwrap().get("x"), Some(&FieldValue::Number(1.0)));
    }

    #[test]
    fn insert_new_refuses_duplicates() {
        let mut table = ResultTable::new();
        assert!(table.insert_new(Record::new("a")));
        assert!(!table.insert_new(Record::not_found("a")));
        assert_eq!(table.get("a").unwrap().status, RowStatus::Ok);
    }

    #[test]
    fn file_stems_are_sanitized() {
        assert_eq!(sanitize_file_stem("p1"), "p1");
        assert_eq!(sanitize_file_stem("41.88-87.63_x"), "41.88-87.63_x");
        let stem = sanitize_file_stem("41.88,-87.63/x");
        assert!(stem.starts_with("41.88_-87.63_x~"), "Unexpected stem: {}", stem);
        assert!(!stem.contains(',') && !stem.contains('/'));
    }

    #[test]
    fn distinct_ids_never_share_a_file_stem() {
        let ids = ["a/b", "a_b", "a b", "a\\b", "41.88,-87.63", "41.88_-87.63"];
        let stems: HashSet<String> = ids.iter().map(|id| sanitize_file_stem(id)).collect();
        assert_eq!(stems.len(), ids.len());
    }

    #[test]
    fn failure_then_success_clears_failure() {
        use crate::config::job::GeocodeParams;
        use crate::pipeline::sources::GeocodeSource;

        let dir = tempfile::tempdir().unwrap();
        let output = OutputConfig {
            path: dir.path().join("out.csv").display().to_string(),
            format: None,
            images_dir: None,
        };
        let params: GeocodeParams = serde_yaml::from_str("{}").unwrap();
        let source = GeocodeSource::new(&params, "k".to_string());
        let mut checkpointer = Checkpointer::open(&source, &output, true).unwrap();

        checkpointer
            .record(RowOutcome::Failed {
                input_id: "a".to_string(),
                reason: "HTTP 503".to_string(),
                kind: FailureKind::Transient,
            })
            .unwrap();
        checkpointer.flush().unwrap();
        assert!(checkpointer.manifest().failed_inputs.contains_key("a"));
        assert!(!checkpointer.is_resolved("a"));

        checkpointer
            .record(RowOutcome::Fetched {
                input_id: "a".to_string(),
                payload: Payload::single(Record::new("a").with("lat", FieldValue::Number(1.0))),
            })
            .unwrap();
        checkpointer.flush().unwrap();
        assert!(checkpointer.manifest().failed_inputs.is_empty());
        assert!(checkpointer.is_resolved("a"));
        assert_eq!(checkpointer.manifest().rows_flushed, 1);
    }
}
