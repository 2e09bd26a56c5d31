//! Run orchestration: validate, connect, plan, then fetch and persist batch
//! by batch.

pub mod progress;

use log::{error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::auth::credentials::CredentialSource;
use crate::domain::email::MessageRecord;
use crate::domain::request::FetchRequest;
use crate::error::Result;
use crate::mail::decoders::MessageDecoder;
use crate::mail::fetcher::{BatchFetcher, BatchOutcome, RetryPolicy, Sleeper, ThreadSleeper, partition};
use crate::mail::imap_client::Connector;
use crate::mail::planner;
use crate::mail::session::{DEFAULT_KEEPALIVE_AFTER, MailSession};
use crate::providers::ConnectionProfile;
use crate::store::csv::CsvExportWriter;
use crate::store::sink::RecordSink;

use progress::{BatchPosition, BatchProgress, ExportSummary, ProgressEvent, ProgressSink, RunFailure};

/// Cooperative stop flag shared between the caller and a running export.
/// Checked before each batch and before each retry attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub keepalive_after: Duration,
    /// Prefix the CSV with a UTF-8 BOM for spreadsheet applications.
    pub excel_bom: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            keepalive_after: DEFAULT_KEEPALIVE_AFTER,
            excel_bom: false,
        }
    }
}

pub struct Exporter<C: Connector> {
    connector: C,
    credentials: Box<dyn CredentialSource>,
    profile: ConnectionProfile,
    decoder: MessageDecoder,
    settings: EngineSettings,
    sleeper: Box<dyn Sleeper>,
}

impl<C: Connector> Exporter<C> {
    pub fn new(
        connector: C,
        credentials: Box<dyn CredentialSource>,
        profile: ConnectionProfile,
    ) -> Self {
        Self {
            connector,
            credentials,
            profile,
            decoder: MessageDecoder::default(),
            settings: EngineSettings::default(),
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_decoder(mut self, decoder: MessageDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    fn session(&self, identity: &str) -> MailSession<'_, C> {
        MailSession::new(
            &self.connector,
            self.credentials.as_ref(),
            self.profile.clone(),
            identity,
        )
        .with_keepalive_after(self.settings.keepalive_after)
    }

    /// Runs one export. Fatal errors are also reported as
    /// [`ProgressEvent::Failed`]; rows flushed before the failure stay in the
    /// output file. Cancellation is not an error.
    pub fn run(
        &self,
        request: &FetchRequest,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<ExportSummary> {
        let mut position = None;
        match self.export(request, progress, cancel, &mut position) {
            Ok(summary) => {
                if summary.cancelled {
                    info!(
                        "Export cancelled after {} of {} batches",
                        summary.batches_written, summary.batches_total
                    );
                } else {
                    info!(
                        "Export finished: {} rows in {}",
                        summary.records_written,
                        summary.output_path.display()
                    );
                }
                progress.report(ProgressEvent::Finished(summary.clone()));
                Ok(summary)
            }
            Err(e) => {
                error!("Export failed: {e}");
                progress.report(ProgressEvent::Failed(RunFailure::from_error(&e, position)));
                Err(e)
            }
        }
    }

    fn export(
        &self,
        request: &FetchRequest,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
        position: &mut Option<BatchPosition>,
    ) -> Result<ExportSummary> {
        request.validate()?;

        let mut summary = ExportSummary {
            output_path: request.output_path.clone(),
            ..ExportSummary::default()
        };

        progress.report(ProgressEvent::Status(format!(
            "Connecting to {}:{}",
            self.profile.host(),
            self.profile.port()
        )));
        let mut session = self.session(&request.mailbox);
        session.open()?;

        let uids = planner::plan(
            &mut session,
            &request.folder,
            request.start_date,
            request.end_date,
        )?;
        let batches_total = uids.len().div_ceil(request.batch_size);
        summary.uids_found = uids.len();
        summary.batches_total = batches_total;
        progress.report(ProgressEvent::Status(format!(
            "Found {} messages in {} ({} batches)",
            uids.len(),
            request.folder,
            batches_total
        )));

        let mut writer = CsvExportWriter::create(&request.output_path, self.settings.excel_bom)?;
        let fetcher = BatchFetcher::new(self.settings.retry, &self.decoder, self.sleeper.as_ref());

        for (i, batch) in partition(&uids, request.batch_size).enumerate() {
            let batch_index = i + 1;
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let (Some(&first_uid), Some(&last_uid)) = (batch.first(), batch.last()) else {
                continue;
            };
            *position = Some(BatchPosition {
                batch_index,
                first_uid,
                last_uid,
            });

            session.keepalive_if_idle();
            let decoded = match fetcher.fetch_batch(&mut session, batch_index, batch, cancel)? {
                BatchOutcome::Fetched(decoded) => decoded,
                BatchOutcome::Cancelled => {
                    summary.cancelled = true;
                    break;
                }
            };

            let mut records: Vec<MessageRecord> = Vec::with_capacity(decoded.len());
            for message in decoded {
                for warning in message.warnings {
                    warn!("{warning}");
                    summary.warnings += 1;
                    progress.report(ProgressEvent::Warning(warning));
                }
                records.push(message.record);
            }

            writer.append_batch(&records)?;
            summary.batches_written = batch_index;
            summary.records_written = writer.rows_written();
            progress.report(ProgressEvent::BatchCompleted(BatchProgress {
                batch_index,
                batches_total: Some(batches_total),
                records_written: summary.records_written,
                last_message: format!(
                    "Saved batch {batch_index}/{batches_total} (UIDs {first_uid}..={last_uid}), {} rows so far",
                    summary.records_written
                ),
            }));
        }

        *position = None;
        writer.finish()?;
        session.close();
        Ok(summary)
    }

    /// Decoded names of every folder in the mailbox.
    pub fn list_folders(&self, identity: &str) -> Result<Vec<String>> {
        let mut session = self.session(identity);
        session.open()?;
        let folders = session.list_folders()?;
        session.close();
        Ok(folders)
    }
}
