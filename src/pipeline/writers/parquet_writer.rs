use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Builder, RecordBatch, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tempfile::NamedTempFile;

use crate::data_model::{Column, ColumnKind, FieldValue, Record};
use crate::error::Result;
use crate::pipeline::writers::base_writer::{persist, temp_file_beside};
use crate::pipeline::writers::BaseWriter;

/// `id` and `status` first, then the source's columns in declaration order.
pub fn table_schema(columns: &[Column]) -> SchemaRef {
    let mut fields = vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("status", DataType::Utf8, false),
    ];
    fields.extend(columns.iter().map(|column| {
        let data_type = match column.kind {
            ColumnKind::Utf8 => DataType::Utf8,
            ColumnKind::Float64 => DataType::Float64,
        };
        Field::new(&column.name, data_type, true)
    }));
    Arc::new(Schema::new(fields))
}

enum ColumnBuilder {
    Text(StringBuilder),
    Number(Float64Builder),
}

impl ColumnBuilder {
    fn for_kind(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Utf8 => ColumnBuilder::Text(StringBuilder::new()),
            ColumnKind::Float64 => ColumnBuilder::Number(Float64Builder::new()),
        }
    }

    fn append(&mut self, value: Option<&FieldValue>) {
        match (self, value) {
            (ColumnBuilder::Text(b), Some(FieldValue::Text(s))) => b.append_value(s),
            (ColumnBuilder::Text(b), Some(FieldValue::Number(n))) => b.append_value(n.to_string()),
            (ColumnBuilder::Text(b), _) => b.append_null(),
            (ColumnBuilder::Number(b), Some(value)) => b.append_option(value.as_f64()),
            (ColumnBuilder::Number(b), None) => b.append_null(),
        }
    }

    fn finish(self) -> ArrayRef {
        match self {
            ColumnBuilder::Text(mut b) => Arc::new(b.finish()) as ArrayRef,
            ColumnBuilder::Number(mut b) => Arc::new(b.finish()) as ArrayRef,
        }
    }
}

/// Writes records to a Parquet file via a temp file that replaces the target on `close`.
pub struct ParquetWriter {
    schema: SchemaRef,
    columns: Vec<Column>,
    writer: Option<ArrowWriter<File>>,
    temp: NamedTempFile,
    final_path: PathBuf,
}

impl ParquetWriter {
    pub fn new(path: &Path, columns: &[Column]) -> Result<Self> {
        let schema = table_schema(columns);
        let temp = temp_file_beside(path)?;
        let file = temp.as_file().try_clone()?;
        let props = WriterProperties::builder().build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;

        Ok(ParquetWriter {
            schema,
            columns: columns.to_vec(),
            writer: Some(writer),
            temp,
            final_path: path.to_path_buf(),
        })
    }
}

impl BaseWriter for ParquetWriter {
    fn write_batch(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut id_builder = StringBuilder::new();
        let mut status_builder = StringBuilder::new();
        let mut builders: Vec<ColumnBuilder> = self
            .columns
            .iter()
            .map(|c| ColumnBuilder::for_kind(c.kind))
            .collect();

        for record in records {
            id_builder.append_value(&record.id);
            status_builder.append_value(record.status.as_str());
            for (column, builder) in self.columns.iter().zip(builders.iter_mut()) {
                builder.append(record.get(&column.name));
            }
        }

        let mut arrays = vec![
            Arc::new(id_builder.finish()) as ArrayRef,
            Arc::new(status_builder.finish()) as ArrayRef,
        ];
        arrays.extend(builders.into_iter().map(ColumnBuilder::finish));

        let batch = RecordBatch::try_new(self.schema.clone(), arrays)?;
        if let Some(writer) = self.writer.as_mut() {
            writer.write(&batch)?;
        }
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        persist(self.temp, &self.final_path)
    }
}
