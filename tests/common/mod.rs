//! In-memory IMAP server stand-in for engine tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use imap_export::auth::credentials::Credential;
use imap_export::domain::email::{RawMessage, Uid};
use imap_export::error::{ExportError, Result};
use imap_export::mail::fetcher::Sleeper;
use imap_export::mail::imap_client::{Connector, MailTransport};
use imap_export::providers::{AuthKind, ConnectionProfile, TlsMode};

#[derive(Clone, Copy, Debug)]
pub enum Fault {
    /// Transient failure on the next `n` fetches touching the UID.
    Transient(u32),
    /// Transient failure on every fetch touching the UID.
    AlwaysTransient,
    /// The server answers NO.
    Protocol,
}

#[derive(Default)]
pub struct Mailbox {
    pub folder: String,
    pub messages: BTreeMap<Uid, Vec<u8>>,
    pub accepted_secret: String,
    pub faults: BTreeMap<Uid, Fault>,
    /// Present in SEARCH results but never returned by FETCH.
    pub unfetchable: HashSet<Uid>,

    pub connects: usize,
    pub presented: Vec<String>,
    pub searches: Vec<String>,
    pub fetches: Vec<Vec<Uid>>,
    pub logouts: usize,
}

#[derive(Clone)]
pub struct FakeConnector {
    pub mailbox: Arc<Mutex<Mailbox>>,
}

impl FakeConnector {
    pub fn new(mailbox: Mailbox) -> Self {
        Self {
            mailbox: Arc::new(Mutex::new(mailbox)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Mailbox) -> R) -> R {
        f(&mut self.mailbox.lock().unwrap())
    }
}

pub struct FakeTransport {
    mailbox: Arc<Mutex<Mailbox>>,
}

impl Connector for FakeConnector {
    type Transport = FakeTransport;

    fn connect(
        &self,
        _: &ConnectionProfile,
        identity: &str,
        credential: &Credential,
    ) -> Result<FakeTransport> {
        let mut mb = self.mailbox.lock().unwrap();
        mb.connects += 1;
        let presented = match credential {
            Credential::Secret(s) => s.clone(),
            Credential::OAuthToken(t) => t.access_token.clone(),
        };
        mb.presented.push(presented.clone());
        if presented != mb.accepted_secret {
            return Err(ExportError::AuthFailed {
                identity: identity.to_string(),
                reason: "AUTHENTICATIONFAILED".into(),
            });
        }
        Ok(FakeTransport {
            mailbox: self.mailbox.clone(),
        })
    }
}

impl MailTransport for FakeTransport {
    fn select(&mut self, folder: &str) -> Result<()> {
        let mb = self.mailbox.lock().unwrap();
        if folder != mb.folder {
            return Err(ExportError::FolderNotFound(folder.to_string()));
        }
        Ok(())
    }

    fn uid_search(&mut self, criterion: &str) -> Result<Vec<Uid>> {
        let mut mb = self.mailbox.lock().unwrap();
        mb.searches.push(criterion.to_string());
        // Servers do not promise any order.
        Ok(mb.messages.keys().rev().copied().collect())
    }

    fn uid_fetch(&mut self, uids: &[Uid]) -> Result<Vec<RawMessage>> {
        let mut mb = self.mailbox.lock().unwrap();
        mb.fetches.push(uids.to_vec());

        for uid in uids {
            match mb.faults.get(uid).copied() {
                Some(Fault::AlwaysTransient) => {
                    return Err(ExportError::Network("connection reset".into()));
                }
                Some(Fault::Transient(n)) if n > 0 => {
                    mb.faults.insert(*uid, Fault::Transient(n - 1));
                    return Err(ExportError::Network("connection reset".into()));
                }
                Some(Fault::Protocol) => {
                    return Err(ExportError::Protocol("FETCH rejected".into()));
                }
                _ => {}
            }
        }

        Ok(uids
            .iter()
            .filter(|uid| !mb.unfetchable.contains(*uid))
            .map(|&uid| RawMessage {
                uid,
                body: mb.messages.get(&uid).cloned(),
                internal_date: None,
            })
            .collect())
    }

    fn list_folders(&mut self) -> Result<Vec<String>> {
        let mb = self.mailbox.lock().unwrap();
        Ok(vec![mb.folder.clone()])
    }

    fn noop(&mut self) -> Result<()> {
        Ok(())
    }

    fn logout(&mut self) -> Result<()> {
        self.mailbox.lock().unwrap().logouts += 1;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingSleeper {
    pub slept: Arc<Mutex<Vec<Duration>>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

pub fn message(uid: Uid) -> Vec<u8> {
    format!(
        "From: Sender {uid} <sender{uid}@example.com>\r\n\
         Subject: Message {uid}\r\n\
         Date: Mon, 1 Jan 2024 10:00:{uid:02} +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Body of message {uid}\r\n"
    )
    .into_bytes()
}

/// Mailbox with UIDs `1..=count` in INBOX, accepting password `secret`.
pub fn mailbox(count: Uid) -> Mailbox {
    Mailbox {
        folder: "INBOX".into(),
        messages: (1..=count).map(|uid| (uid, message(uid))).collect(),
        accepted_secret: "secret".into(),
        ..Mailbox::default()
    }
}

pub fn profile(auth: AuthKind) -> ConnectionProfile {
    ConnectionProfile::new("custom", "imap.example.com", 993, TlsMode::Implicit, auth).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Data rows of a CSV written by the exporter (header excluded). Test
/// messages have single-line fields.
pub fn data_rows(path: &Path) -> Vec<String> {
    let text = std::fs::read_to_string(path).unwrap();
    text.split("\r\n")
        .skip(1)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
