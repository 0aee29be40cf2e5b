use std::io::BufWriter;
use std::path::{Path, PathBuf};

use csv::Writer;
use tempfile::NamedTempFile;

use crate::data_model::{Column, Record};
use crate::error::{FetchError, Result};
use crate::pipeline::writers::base_writer::{persist, temp_file_beside};
use crate::pipeline::writers::BaseWriter;

/// CSV counterpart of `ParquetWriter`. Nulls are written as empty cells.
pub struct CsvTableWriter {
    writer: Writer<BufWriter<NamedTempFile>>,
    columns: Vec<Column>,
    final_path: PathBuf,
}

impl CsvTableWriter {
    pub fn new(path: &Path, columns: &[Column]) -> Result<Self> {
        let temp = temp_file_beside(path)?;
        let mut writer = Writer::from_writer(BufWriter::new(temp));
        let header = ["id", "status"]
            .into_iter()
            .chain(columns.iter().map(|c| c.name.as_str()));
        writer.write_record(header)?;
        Ok(CsvTableWriter {
            writer,
            columns: columns.to_vec(),
            final_path: path.to_path_buf(),
        })
    }
}

impl BaseWriter for CsvTableWriter {
    fn write_batch(&mut self, records: &[Record]) -> Result<()> {
        for record in records {
            let mut row = Vec::with_capacity(self.columns.len() + 2);
            row.push(record.id.clone());
            row.push(record.status.as_str().to_string());
            for column in &self.columns {
                row.push(
                    record
                        .get(&column.name)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
            }
            self.writer.write_record(&row)?;
        }
        Ok(())
    }

    fn close(self) -> Result<()> {
        let buffered = self.writer.into_inner().map_err(|e| {
            FetchError::Unexpected(format!("Failed to flush CSV writer: {}", e.error()))
        })?;
        let temp = buffered.into_inner().map_err(|e| {
            FetchError::Unexpected(format!("Failed to flush buffer: {}", e.error()))
        })?;
        persist(temp, &self.final_path)
    }
}
