// src/pipeline/writers/mod.rs

pub mod base_writer;
pub mod csv_writer;
pub mod parquet_writer;

pub use base_writer::BaseWriter;
pub use csv_writer::CsvTableWriter;
pub use parquet_writer::ParquetWriter;

use std::path::Path;

use crate::config::TableFormat;
use crate::data_model::{Column, Record};
use crate::error::Result;

/// Replaces the table at `path` with `records`, all at once.
pub fn write_table(
    path: &Path,
    format: TableFormat,
    columns: &[Column],
    records: &[Record],
) -> Result<()> {
    match format {
        TableFormat::Csv => {
            let mut writer = CsvTableWriter::new(path, columns)?;
            writer.write_batch(records)?;
            writer.close()
        }
        TableFormat::Parquet => {
            let mut writer = ParquetWriter::new(path, columns)?;
            writer.write_batch(records)?;
            writer.close()
        }
    }
}
