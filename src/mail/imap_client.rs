//! Transport seam for the Connection Manager plus the real IMAP transport
//! built on the `imap` crate.

use chrono::Utc;
use log::{debug, info};
use native_tls::TlsConnector;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::auth::credentials::Credential;
use crate::domain::email::{RawMessage, Uid};
use crate::error::{ExportError, Result};
use crate::mail::utf7;
use crate::providers::{ConnectionProfile, TlsMode};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

const FETCH_ITEMS: &str = "(UID INTERNALDATE BODY.PEEK[])";

/// One authenticated IMAP session. Commands are sequential.
pub trait MailTransport {
    /// Fails with `FolderNotFound` when the server has no such mailbox.
    fn select(&mut self, folder: &str) -> Result<()>;

    /// UID SEARCH; the order of the result is unspecified.
    fn uid_search(&mut self, criterion: &str) -> Result<Vec<Uid>>;

    /// UID FETCH of full message bodies. Returns one entry per requested
    /// UID in request order; UIDs the server did not return have no body.
    fn uid_fetch(&mut self, uids: &[Uid]) -> Result<Vec<RawMessage>>;

    /// Folder names as sent by the server (modified UTF-7).
    fn list_folders(&mut self) -> Result<Vec<String>>;

    fn noop(&mut self) -> Result<()>;

    fn logout(&mut self) -> Result<()>;
}

/// Opens and authenticates sessions.
pub trait Connector {
    type Transport: MailTransport;

    /// Connects, reads the greeting and authenticates. A rejected
    /// credential is reported as `AuthFailed`.
    fn connect(
        &self,
        profile: &ConnectionProfile,
        identity: &str,
        credential: &Credential,
    ) -> Result<Self::Transport>;
}

pub trait ImapStream: Read + Write + Send {}
impl<T: Read + Write + Send> ImapStream for T {}

type Session = imap::Session<Box<dyn ImapStream>>;

/// SASL XOAUTH2 initial response. The crate base64-encodes it.
struct XOAuth2 {
    response: String,
}

impl XOAuth2 {
    fn new(user: &str, access_token: &str) -> Self {
        Self {
            response: format!("user={user}\x01auth=Bearer {access_token}\x01\x01"),
        }
    }
}

impl imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        self.response.clone()
    }
}

/// Maps an `imap` error onto the run's taxonomy. Callers refine `No`/`Bad`
/// where the command gives them a more specific meaning.
fn classify(e: imap::Error) -> ExportError {
    match e {
        imap::Error::Io(e) => io_error(e),
        imap::Error::ConnectionLost => ExportError::Network("connection lost".into()),
        imap::Error::Tls(e) => ExportError::Network(format!("TLS error: {e}")),
        // A truncated or garbled response usually means a broken stream.
        imap::Error::Parse(e) => ExportError::Network(format!("unparseable response: {e}")),
        imap::Error::Bad(msg) | imap::Error::No(msg) => ExportError::Protocol(msg),
        other => ExportError::Protocol(other.to_string()),
    }
}

fn io_error(e: io::Error) -> ExportError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ExportError::Network(format!("timed out: {e}"))
        }
        _ => ExportError::Network(e.to_string()),
    }
}

fn tls_connector() -> Result<TlsConnector> {
    TlsConnector::builder()
        .build()
        .map_err(|e| ExportError::Network(format!("cannot initialise TLS: {e}")))
}

/// `imap` crate backed [`Connector`].
#[derive(Debug, Clone)]
pub struct ImapConnector {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl Default for ImapConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT)
    }
}

impl ImapConnector {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }

    fn tcp(&self, profile: &ConnectionProfile) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = (profile.host(), profile.port())
            .to_socket_addrs()
            .map_err(|e| ExportError::Network(format!("cannot resolve {}: {e}", profile.host())))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(tcp) => {
                    tcp.set_read_timeout(Some(self.io_timeout))?;
                    tcp.set_write_timeout(Some(self.io_timeout))?;
                    return Ok(tcp);
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) if e.kind() == io::ErrorKind::TimedOut => ExportError::ConnectTimeout {
                host: profile.host().to_string(),
                port: profile.port(),
            },
            Some(e) => ExportError::Network(format!(
                "cannot connect to {}:{}: {e}",
                profile.host(),
                profile.port()
            )),
            None => ExportError::Network(format!("{} has no addresses", profile.host())),
        })
    }

    /// Returns a client whose greeting has been consumed.
    fn open(&self, profile: &ConnectionProfile) -> Result<imap::Client<Box<dyn ImapStream>>> {
        let tcp = self.tcp(profile)?;
        let host = profile.host();

        let (stream, greeted): (Box<dyn ImapStream>, bool) = match profile.tls() {
            TlsMode::Implicit => {
                let tls = tls_connector()?
                    .connect(host, tcp)
                    .map_err(|e| ExportError::Network(format!("TLS handshake with {host}: {e}")))?;
                (Box::new(tls), false)
            }
            TlsMode::StartTls => (Box::new(starttls(tcp, host)?), true),
            TlsMode::Plain => (Box::new(tcp), false),
        };

        let mut client = imap::Client::new(stream);
        if !greeted {
            let greeting = client.read_greeting().map_err(classify)?;
            debug!("greeting: {}", String::from_utf8_lossy(&greeting).trim_end());
        }
        Ok(client)
    }
}

/// Reads the plaintext greeting, issues STARTTLS and performs the handshake.
fn starttls(tcp: TcpStream, host: &str) -> Result<native_tls::TlsStream<TcpStream>> {
    let mut writer = tcp.try_clone()?;
    let mut reader = BufReader::new(tcp);
    let mut line = String::new();

    reader.read_line(&mut line)?;
    if !line.starts_with("* OK") {
        return Err(ExportError::Protocol(format!(
            "unexpected greeting: {}",
            line.trim_end()
        )));
    }

    writer.write_all(b"a0 STARTTLS\r\n")?;
    writer.flush()?;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(ExportError::Network("connection closed during STARTTLS".into()));
        }
        if let Some(status) = line.strip_prefix("a0 ") {
            if status.starts_with("OK") {
                break;
            }
            return Err(ExportError::Protocol(format!(
                "STARTTLS refused: {}",
                status.trim_end()
            )));
        }
    }

    let tcp = reader.into_inner();
    tls_connector()?
        .connect(host, tcp)
        .map_err(|e| ExportError::Network(format!("TLS handshake with {host}: {e}")))
}

impl Connector for ImapConnector {
    type Transport = ImapTransport;

    fn connect(
        &self,
        profile: &ConnectionProfile,
        identity: &str,
        credential: &Credential,
    ) -> Result<ImapTransport> {
        let client = self.open(profile)?;

        let rejected = |e: imap::Error| match e {
            imap::Error::No(reason) | imap::Error::Bad(reason) => ExportError::AuthFailed {
                identity: identity.to_string(),
                reason,
            },
            other => classify(other),
        };

        let session = match credential {
            Credential::Secret(secret) => client.login(identity, secret).map_err(|(e, _)| rejected(e))?,
            Credential::OAuthToken(token) => client
                .authenticate("XOAUTH2", &XOAuth2::new(identity, &token.access_token))
                .map_err(|(e, _)| rejected(e))?,
        };

        info!(
            "Authenticated to {}:{} as {identity}",
            profile.host(),
            profile.port()
        );
        Ok(ImapTransport { session })
    }
}

pub struct ImapTransport {
    session: Session,
}

impl MailTransport for ImapTransport {
    fn select(&mut self, folder: &str) -> Result<()> {
        let mailbox = self
            .session
            .select(utf7::wire_name(folder))
            .map_err(|e| match e {
                imap::Error::No(_) => ExportError::FolderNotFound(folder.to_string()),
                other => classify(other),
            })?;
        debug!("selected {folder}: {} messages", mailbox.exists);
        Ok(())
    }

    fn uid_search(&mut self, criterion: &str) -> Result<Vec<Uid>> {
        let uids = self.session.uid_search(criterion).map_err(|e| match e {
            imap::Error::No(reason) | imap::Error::Bad(reason) => ExportError::Search {
                criterion: criterion.to_string(),
                reason,
            },
            other => classify(other),
        })?;
        Ok(uids.into_iter().collect())
    }

    fn uid_fetch(&mut self, uids: &[Uid]) -> Result<Vec<RawMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let fetches = self.session.uid_fetch(&set, FETCH_ITEMS).map_err(classify)?;

        let mut by_uid: HashMap<Uid, RawMessage> = HashMap::with_capacity(uids.len());
        for f in fetches.iter() {
            let Some(uid) = f.uid else {
                continue;
            };
            by_uid.insert(
                uid,
                RawMessage {
                    uid,
                    body: f.body().map(|b| b.to_vec()),
                    internal_date: f.internal_date().map(|d| d.with_timezone(&Utc)),
                },
            );
        }

        Ok(uids
            .iter()
            .map(|uid| {
                by_uid.remove(uid).unwrap_or(RawMessage {
                    uid: *uid,
                    body: None,
                    internal_date: None,
                })
            })
            .collect())
    }

    fn list_folders(&mut self) -> Result<Vec<String>> {
        let names = self
            .session
            .list(Some(""), Some("*"))
            .map_err(classify)?;
        Ok(names.iter().map(|n| n.name().to_string()).collect())
    }

    fn noop(&mut self) -> Result<()> {
        self.session.noop().map_err(classify)
    }

    fn logout(&mut self) -> Result<()> {
        self.session.logout().map_err(classify)
    }
}
