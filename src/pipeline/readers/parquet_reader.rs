// src/pipeline/readers/parquet_reader.rs

use std::fs::File;
use std::path::Path;

use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::config::InputConfig;
use crate::data_model::{Column, ColumnKind, FieldValue, InputRow, Record, RowStatus};
use crate::error::{FetchError, Result};
use crate::pipeline::readers::{row_id, BaseReader};

/// Reads input rows from a Parquet file. Every column is rendered as text.
#[derive(Debug)]
pub struct ParquetReader {
    config: InputConfig,
}

impl ParquetReader {
    pub fn new(config: InputConfig) -> Self {
        ParquetReader { config }
    }
}

fn batch_to_rows(
    batch: &RecordBatch,
    id_column: Option<&str>,
    offset: usize,
    source: &str,
) -> Result<Vec<InputRow>> {
    let schema = batch.schema();
    let id_idx = match id_column {
        Some(name) => Some(schema.index_of(name).map_err(|_| {
            FetchError::ConfigError(format!(
                "ID column '{}' not found in Parquet schema of '{}'.",
                name, source
            ))
        })?),
        None => None,
    };

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let mut fields = std::collections::BTreeMap::new();
        for (col_idx, field) in schema.fields().iter().enumerate() {
            let array = batch.column(col_idx);
            if array.is_null(i) {
                continue;
            }
            fields.insert(field.name().clone(), array_value_to_string(array, i)?);
        }
        let id_value = id_idx.and_then(|idx| fields.get(schema.field(idx).name()).cloned());
        let id = row_id(id_column, id_value, offset + i, source)?;
        rows.push(InputRow { id, fields });
    }
    Ok(rows)
}

impl BaseReader for ParquetReader {
    fn read_rows(&self) -> Result<Box<dyn Iterator<Item = Result<InputRow>>>> {
        let file = File::open(&self.config.path).map_err(|e| {
            FetchError::InputError(format!(
                "Failed to open input '{}': {}",
                self.config.path, e
            ))
        })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let builder = if let Some(batch_size) = self.config.batch_size {
            builder.with_batch_size(batch_size)
        } else {
            builder
        };
        let record_batch_reader = builder.build()?;

        let id_column = self.config.id_column.clone();
        let source = self.config.path.clone();
        let mut offset = 0usize;

        let iterator = record_batch_reader.flat_map(move |batch_result| {
            let rows = match batch_result {
                Ok(batch) => {
                    let start = offset;
                    offset += batch.num_rows();
                    batch_to_rows(&batch, id_column.as_deref(), start, &source)
                }
                Err(e) => Err(FetchError::Unexpected(format!(
                    "Failed to read Parquet batch from '{}': {}",
                    source, e
                ))),
            };
            match rows {
                Ok(rows) => rows.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            }
        });

        Ok(Box::new(iterator))
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| FetchError::Unexpected(format!("Output table has no '{}' column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| {
            FetchError::Unexpected(format!("Column '{}' is not a valid Utf8 StringArray", name))
        })
}

fn field_value(array: &ArrayRef, kind: ColumnKind, i: usize, name: &str) -> Result<FieldValue> {
    if array.is_null(i) {
        return Ok(FieldValue::Null);
    }
    match kind {
        ColumnKind::Utf8 => array
            .as_any()
            .downcast_ref::<StringArray>()
            .map(|a| FieldValue::Text(a.value(i).to_string()))
            .ok_or_else(|| {
                FetchError::Unexpected(format!("Column '{}' is not a valid Utf8 StringArray", name))
            }),
        ColumnKind::Float64 => array
            .as_any()
            .downcast_ref::<Float64Array>()
            .map(|a| FieldValue::Number(a.value(i)))
            .ok_or_else(|| {
                FetchError::Unexpected(format!("Column '{}' is not a valid Float64Array", name))
            }),
    }
}

/// Reads back an output table written by `ParquetWriter`.
pub fn read_records(path: &Path, columns: &[Column]) -> Result<Vec<Record>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut records = Vec::new();
    for batch_result in reader {
        let batch = batch_result?;
        let ids = string_column(&batch, "id")?;
        let statuses = string_column(&batch, "status")?;
        let arrays: Vec<(&Column, Option<&ArrayRef>)> = columns
            .iter()
            .map(|c| (c, batch.column_by_name(&c.name)))
            .collect();
        for i in 0..batch.num_rows() {
            let mut record = Record::new(ids.value(i));
            record.status = RowStatus::parse(statuses.value(i))?;
            for (column, array) in &arrays {
                // Columns added since the file was written read as null.
                let value = match array {
                    Some(array) => field_value(array, column.kind, i, &column.name)?,
                    None => FieldValue::Null,
                };
                record.set(&column.name, value);
            }
            records.push(record);
        }
    }
    Ok(records)
}
