// src/pipeline/readers/mod.rs

pub mod base_reader;
pub mod csv_reader;
pub mod parquet_reader;

pub use base_reader::BaseReader;
pub use csv_reader::CsvReader;
pub use parquet_reader::ParquetReader;

use std::path::Path;

use crate::config::{InputConfig, TableFormat};
use crate::data_model::{Column, InputRow, Record};
use crate::error::{FetchError, Result};

/// Picks a reader for the configured input format.
pub fn open_input(config: &InputConfig) -> Result<Box<dyn BaseReader>> {
    match config.resolved_format()? {
        TableFormat::Csv => Ok(Box::new(CsvReader::new(config.clone()))),
        TableFormat::Parquet => Ok(Box::new(ParquetReader::new(config.clone()))),
    }
}

/// Reads every input row, failing on the first bad one.
pub fn read_all(config: &InputConfig) -> Result<Vec<InputRow>> {
    open_input(config)?.read_rows()?.collect()
}

/// Reads back a table previously written by one of the writers.
pub fn read_table(path: &Path, format: TableFormat, columns: &[Column]) -> Result<Vec<Record>> {
    match format {
        TableFormat::Csv => csv_reader::read_records(path, columns),
        TableFormat::Parquet => parquet_reader::read_records(path, columns),
    }
}

/// Identifier for row `index`, from the id column when configured.
pub(crate) fn row_id(
    id_column: Option<&str>,
    value: Option<String>,
    index: usize,
    source: &str,
) -> Result<String> {
    match (id_column, value) {
        (None, _) => Ok(format!("row_{}", index)),
        (Some(_), Some(id)) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        (Some(column), _) => Err(FetchError::InputError(format!(
            "Row {} in '{}' has an empty id column '{}'",
            index, source, column
        ))),
    }
}
