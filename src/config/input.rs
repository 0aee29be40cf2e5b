use std::path::Path;

use serde::Deserialize;

use crate::error::{FetchError, Result};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    Csv,
    Parquet,
}

impl TableFormat {
    /// Picks the format from the file extension (`.csv` or `.parquet`).
    pub fn from_path(path: &str) -> Result<Self> {
        match Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") => Ok(TableFormat::Csv),
            Some("parquet") | Some("pq") => Ok(TableFormat::Parquet),
            _ => Err(FetchError::ConfigError(format!(
                "Cannot infer table format from '{}'; set `format` explicitly",
                path
            ))),
        }
    }
}

/// Where input rows come from.
#[derive(Deserialize, Debug, Clone)]
pub struct InputConfig {
    pub path: String,
    #[serde(default)]
    pub format: Option<TableFormat>,
    /// Column holding the row identifier. Sources derive one when absent.
    #[serde(default)]
    pub id_column: Option<String>,
    /// Arrow batch size when reading Parquet.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl InputConfig {
    pub fn resolved_format(&self) -> Result<TableFormat> {
        match self.format {
            Some(format) => Ok(format),
            None => TableFormat::from_path(&self.path),
        }
    }
}

/// Where the accumulated table (and any images) go.
#[derive(Deserialize, Debug, Clone)]
pub struct OutputConfig {
    pub path: String,
    #[serde(default)]
    pub format: Option<TableFormat>,
    #[serde(default)]
    pub images_dir: Option<String>,
}

impl OutputConfig {
    pub fn resolved_format(&self) -> Result<TableFormat> {
        match self.format {
            Some(format) => Ok(format),
            None => TableFormat::from_path(&self.path),
        }
    }

    pub fn manifest_path(&self) -> String {
        format!("{}.manifest.json", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_is_inferred_from_extension() {
        assert_eq!(
            TableFormat::from_path("data/censusdata.csv").unwrap(),
            TableFormat::Csv
        );
        assert_eq!(
            TableFormat::from_path("data/raw/segments.PARQUET").unwrap(),
            TableFormat::Parquet
        );
        assert!(TableFormat::from_path("data/points").is_err());
    }

    #[test]
    fn explicit_format_wins() {
        let output = OutputConfig {
            path: "data/out.dat".to_string(),
            format: Some(TableFormat::Parquet),
            images_dir: None,
        };
        assert_eq!(output.resolved_format().unwrap(), TableFormat::Parquet);
        assert_eq!(output.manifest_path(), "data/out.dat.manifest.json");
    }
}
