//! Progress channel from the engine to its caller. One-directional; the
//! engine never waits on the caller.

use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::mpsc;

use crate::domain::email::{DecodeWarning, Uid};
use crate::error::{ErrorKind, ExportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based.
    pub batch_index: usize,
    /// `None` while the universe is still unknown.
    pub batches_total: Option<usize>,
    pub records_written: usize,
    pub last_message: String,
}

/// Where in the run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPosition {
    pub batch_index: usize,
    pub first_uid: Uid,
    pub last_uid: Uid,
}

/// Structured report of a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub position: Option<BatchPosition>,
}

impl RunFailure {
    pub fn from_error(error: &ExportError, position: Option<BatchPosition>) -> Self {
        let position = match error {
            ExportError::BatchFetch {
                batch_index,
                first_uid,
                last_uid,
                ..
            } => Some(BatchPosition {
                batch_index: *batch_index,
                first_uid: *first_uid,
                last_uid: *last_uid,
            }),
            _ => position,
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            position,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub output_path: PathBuf,
    pub uids_found: usize,
    pub batches_total: usize,
    pub batches_written: usize,
    pub records_written: usize,
    pub warnings: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Status(String),
    BatchCompleted(BatchProgress),
    Warning(DecodeWarning),
    Failed(RunFailure),
    Finished(ExportSummary),
}

pub trait ProgressSink {
    fn report(&self, event: ProgressEvent);
}

/// Forwards events to another thread. A hung-up receiver is ignored.
impl ProgressSink for mpsc::Sender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

/// Writes events to the log.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Status(s) => info!("{s}"),
            ProgressEvent::BatchCompleted(p) => info!("{}", p.last_message),
            ProgressEvent::Warning(w) => warn!("{w}"),
            ProgressEvent::Failed(f) => error!("{:?}: {}", f.kind, f.message),
            ProgressEvent::Finished(s) => info!(
                "Wrote {} rows to {}",
                s.records_written,
                s.output_path.display()
            ),
        }
    }
}
