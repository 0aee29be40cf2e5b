use crate::data_model::InputRow;
use crate::error::Result;

/// Streams input rows from a tabular file.
pub trait BaseReader {
    fn read_rows(&self) -> Result<Box<dyn Iterator<Item = Result<InputRow>>>>;
}
