//! CSV export file: header once, then one durable append per batch.

use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::domain::email::MessageRecord;
use crate::error::{ExportError, Result};
use crate::store::sink::RecordSink;

pub const HEADER: [&str; 4] = ["timestamp", "sender", "subject", "body"];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Quotes a field when it contains a delimiter, quote or line break.
pub fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn push_row<'a>(buf: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    let mut first = true;
    for field in fields {
        if !first {
            buf.push(',');
        }
        first = false;
        buf.push_str(&escape_field(field));
    }
    buf.push_str("\r\n");
}

pub fn format_row(record: &MessageRecord) -> String {
    let mut row = String::new();
    let timestamp = record.timestamp();
    push_row(
        &mut row,
        [
            timestamp.as_str(),
            record.sender.as_str(),
            record.subject.as_str(),
            record.body_text.as_str(),
        ],
    );
    row
}

/// Storage under a [`CsvExportWriter`].
pub trait ExportFile: Write {
    fn sync(&mut self) -> io::Result<()>;

    /// Cuts the file back to `len` bytes and continues writing there.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl ExportFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        self.sync_data()
    }
}

/// Owns the output file for one run. The file is truncated on creation.
/// A failed append is rolled back so the file always ends on a batch
/// boundary.
pub struct CsvExportWriter<F: ExportFile = File> {
    path: PathBuf,
    file: Option<F>,
    rows: usize,
    committed: u64,
}

impl CsvExportWriter {
    pub fn create(path: impl AsRef<Path>, bom: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| ExportError::output(&path, e))?;
        Self::start(path, file, bom)
    }
}

impl<F: ExportFile> CsvExportWriter<F> {
    fn start(path: PathBuf, file: F, bom: bool) -> Result<Self> {
        let mut writer = Self {
            path,
            file: Some(file),
            rows: 0,
            committed: 0,
        };

        let mut head = Vec::new();
        if bom {
            head.extend_from_slice(UTF8_BOM);
        }
        let mut line = String::new();
        push_row(&mut line, HEADER);
        head.extend_from_slice(line.as_bytes());
        writer.write_durably(&head)?;

        debug!("Opened {} for export", writer.path.display());
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_durably(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            ExportError::output(
                &self.path,
                io::Error::other("export file already closed"),
            )
        })?;

        let written = file
            .write_all(bytes)
            .and_then(|_| file.flush())
            .and_then(|_| file.sync());
        if let Err(e) = written {
            if let Err(undo) = file.truncate_to(self.committed) {
                warn!(
                    "Could not roll {} back to {} bytes: {undo}",
                    self.path.display(),
                    self.committed
                );
            }
            return Err(ExportError::output(&self.path, e));
        }
        self.committed += bytes.len() as u64;
        Ok(())
    }
}

impl<F: ExportFile> RecordSink for CsvExportWriter<F> {
    fn append_batch(&mut self, records: &[MessageRecord]) -> Result<()> {
        // One write per batch; on failure it is cut back to the last batch.
        let buf: String = records.iter().map(format_row).collect();
        self.write_durably(buf.as_bytes())?;
        self.rows += records.len();
        Ok(())
    }

    fn rows_written(&self) -> usize {
        self.rows
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.sync()
                .map_err(|e| ExportError::output(&self.path, e))?;
        }
        Ok(())
    }
}

impl<F: ExportFile> Drop for CsvExportWriter<F> {
    fn drop(&mut self) {
        if let Some(mut file) = self.file.take()
            && let Err(e) = file.sync()
        {
            warn!("Could not sync {}: {e}", self.path.display());
        }
    }
}
