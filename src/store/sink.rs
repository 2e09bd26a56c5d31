use crate::domain::email::MessageRecord;
use crate::error::Result;

/// Destination for exported records. Every `append_batch` is a durability
/// boundary: when it returns, the batch's rows are on stable storage.
pub trait RecordSink {
    /// Writes one row per record, in order, then flushes and syncs.
    fn append_batch(&mut self, records: &[MessageRecord]) -> Result<()>;

    /// Data rows written so far (header excluded).
    fn rows_written(&self) -> usize;

    /// Final flush. Further appends are an error.
    fn finish(&mut self) -> Result<()>;
}
