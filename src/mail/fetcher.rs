//! Batch Fetcher: fixed-size UID batches, each retried as a whole with
//! exponential backoff.

use log::{debug, warn};
use std::time::Duration;

use crate::domain::email::{
    DecodeField, DecodeWarning, DecodedMessage, MessageRecord, RawMessage, Uid,
};
use crate::engine::CancelToken;
use crate::error::{ExportError, Result};
use crate::mail::decoders::MessageDecoder;
use crate::mail::imap_client::Connector;
use crate::mail::session::MailSession;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Bounded attempts per batch; the delay doubles after each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): base, 2*base, 4*base...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exp)
    }

    /// Every delay a batch that always fails would sleep through.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|a| self.delay_after(a)).collect()
    }
}

/// Backoff sleeping, injectable so tests do not wait.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Splits the ordered universe into batches, preserving order.
pub fn partition(uids: &[Uid], batch_size: usize) -> std::slice::Chunks<'_, Uid> {
    uids.chunks(batch_size.max(1))
}

#[derive(Debug)]
pub enum BatchOutcome {
    Fetched(Vec<DecodedMessage>),
    /// Cancellation was observed before a retry attempt.
    Cancelled,
}

pub struct BatchFetcher<'a> {
    policy: RetryPolicy,
    decoder: &'a MessageDecoder,
    sleeper: &'a dyn Sleeper,
}

impl<'a> BatchFetcher<'a> {
    pub fn new(policy: RetryPolicy, decoder: &'a MessageDecoder, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            policy,
            decoder,
            sleeper,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fetches and decodes one batch. Transient errors reconnect and retry
    /// the whole batch; anything else, or running out of attempts, ends the
    /// run.
    pub fn fetch_batch<C: Connector>(
        &self,
        session: &mut MailSession<'_, C>,
        batch_index: usize,
        uids: &[Uid],
        cancel: &CancelToken,
    ) -> Result<BatchOutcome> {
        let (Some(&first_uid), Some(&last_uid)) = (uids.first(), uids.last()) else {
            return Ok(BatchOutcome::Fetched(Vec::new()));
        };

        let mut attempt: u32 = 0;
        let last_error = loop {
            attempt += 1;

            if attempt > 1 {
                if cancel.is_cancelled() {
                    debug!("batch {batch_index}: cancelled before attempt {attempt}");
                    return Ok(BatchOutcome::Cancelled);
                }
                let delay = self.policy.delay_after(attempt - 1);
                debug!("batch {batch_index}: attempt {attempt} in {delay:?}");
                self.sleeper.sleep(delay);

                if let Err(e) = session.reconnect() {
                    if !e.is_transient() {
                        return Err(e);
                    }
                    warn!("batch {batch_index}: reconnect failed on attempt {attempt}: {e}");
                    if attempt >= self.policy.max_attempts {
                        break e;
                    }
                    continue;
                }
            }

            match session.fetch(uids) {
                Ok(raw) => return Ok(BatchOutcome::Fetched(self.decode_all(uids, raw))),
                Err(e) if e.is_transient() => {
                    warn!(
                        "batch {batch_index} (UIDs {first_uid}..={last_uid}): attempt {attempt}/{} failed: {e}",
                        self.policy.max_attempts
                    );
                    if attempt >= self.policy.max_attempts {
                        break e;
                    }
                }
                Err(e) => return Err(e),
            }
        };

        Err(ExportError::BatchFetch {
            batch_index,
            first_uid,
            last_uid,
            attempts: attempt,
            source: Box::new(last_error),
        })
    }

    /// One decoded message per requested UID, in request order.
    fn decode_all(&self, uids: &[Uid], raw: Vec<RawMessage>) -> Vec<DecodedMessage> {
        let mut raw = raw.into_iter().peekable();
        uids.iter()
            .map(|&uid| match raw.next_if(|m| m.uid == uid) {
                Some(message) => self.decoder.decode(&message),
                None => DecodedMessage {
                    record: MessageRecord::placeholder(uid),
                    warnings: vec![DecodeWarning {
                        uid,
                        field: DecodeField::Message,
                        detail: "not returned by the server".into(),
                    }],
                },
            })
            .collect()
    }
}
