// src/pipeline/readers/csv_reader.rs

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::InputConfig;
use crate::data_model::{Column, ColumnKind, FieldValue, InputRow, Record, RowStatus};
use crate::error::{FetchError, Result};
use crate::pipeline::readers::{row_id, BaseReader};

/// Reads input rows from a CSV file with a header line. Empty cells are omitted.
#[derive(Debug)]
pub struct CsvReader {
    config: InputConfig,
}

impl CsvReader {
    pub fn new(config: InputConfig) -> Self {
        CsvReader { config }
    }
}

impl BaseReader for CsvReader {
    fn read_rows(&self) -> Result<Box<dyn Iterator<Item = Result<InputRow>>>> {
        let mut reader = csv::Reader::from_path(&self.config.path).map_err(|e| {
            FetchError::InputError(format!(
                "Failed to open input '{}': {}",
                self.config.path, e
            ))
        })?;
        let headers = reader.headers()?.clone();
        if let Some(id_column) = &self.config.id_column {
            if !headers.iter().any(|h| h == id_column) {
                return Err(FetchError::ConfigError(format!(
                    "ID column '{}' not found in CSV header of '{}'.",
                    id_column, self.config.path
                )));
            }
        }

        let id_column = self.config.id_column.clone();
        let source = self.config.path.clone();
        let iterator = reader
            .into_records()
            .enumerate()
            .map(move |(index, record)| -> Result<InputRow> {
                let record = record?;
                let fields: BTreeMap<String, String> = headers
                    .iter()
                    .zip(record.iter())
                    .filter(|(_, value)| !value.is_empty())
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect();
                let id_value = id_column
                    .as_deref()
                    .and_then(|column| fields.get(column).cloned());
                let id = row_id(id_column.as_deref(), id_value, index, &source)?;
                Ok(InputRow { id, fields })
            });
        Ok(Box::new(iterator))
    }
}

/// Reads back an output table written by `CsvTableWriter`. Empty cells read as null.
pub fn read_records(path: &Path, columns: &[Column]) -> Result<Vec<Record>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h == name);
    let id_idx = position("id").ok_or_else(|| {
        FetchError::Unexpected(format!("Output table '{}' has no 'id' column", path.display()))
    })?;
    let status_idx = position("status").ok_or_else(|| {
        FetchError::Unexpected(format!(
            "Output table '{}' has no 'status' column",
            path.display()
        ))
    })?;
    let indexes: Vec<(&Column, Option<usize>)> =
        columns.iter().map(|c| (c, position(&c.name))).collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut record = Record::new(row.get(id_idx).unwrap_or(""));
        record.status = RowStatus::parse(row.get(status_idx).unwrap_or(""))?;
        for (column, idx) in &indexes {
            let raw = idx.and_then(|i| row.get(i)).unwrap_or("");
            let value = match (raw.is_empty(), column.kind) {
                (true, _) => FieldValue::Null,
                (false, ColumnKind::Utf8) => FieldValue::text(raw),
                (false, ColumnKind::Float64) => raw
                    .parse::<f64>()
                    .map(FieldValue::Number)
                    .unwrap_or(FieldValue::Null),
            };
            record.set(&column.name, value);
        }
        records.push(record);
    }
    Ok(records)
}
