use std::path::Path;

use tempfile::NamedTempFile;

use crate::data_model::Record;
use crate::error::{FetchError, Result};

/// Writes output rows to a sink that only becomes visible on `close`.
pub trait BaseWriter {
    /// Write a batch of records to the sink.
    fn write_batch(&mut self, records: &[Record]) -> Result<()>;

    /// Finalize the output and move it into place.
    fn close(self) -> Result<()>;
}

/// Temp file in the destination's directory, so the final rename stays on one filesystem.
pub(crate) fn temp_file_beside(final_path: &Path) -> Result<NamedTempFile> {
    let parent = match final_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    Ok(NamedTempFile::new_in(parent)?)
}

/// Atomically replaces `final_path` with the temp file.
pub(crate) fn persist(temp: NamedTempFile, final_path: &Path) -> Result<()> {
    temp.persist(final_path).map_err(|e| {
        FetchError::IoError {
            source: std::io::Error::new(
                e.error.kind(),
                format!("Failed to persist file to {}: {}", final_path.display(), e.error),
            ),
        }
    })?;
    Ok(())
}
