//! Error taxonomy for an export run.

use std::path::PathBuf;
use thiserror::Error;

use crate::domain::email::Uid;

/// Coarse classification used by the retry boundary and by callers that
/// only need to know who has to act on a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request shape or configuration; caught before any network I/O.
    Config,
    /// Wrong secret or rejected OAuth grant; needs the user.
    Auth,
    /// Timeouts and resets; retried by the batch fetcher.
    TransientNetwork,
    /// The server rejected a command as malformed.
    Protocol,
    /// The output file could not be written.
    Output,
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("authorization for {identity} has expired; re-authorize to continue")]
    AuthExpired { identity: String },

    #[error("authentication failed for {identity}: {reason}")]
    AuthFailed { identity: String, reason: String },

    #[error("timed out connecting to {host}:{port}")]
    ConnectTimeout { host: String, port: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("folder '{0}' does not exist on the server")]
    FolderNotFound(String),

    #[error("server rejected search '{criterion}': {reason}")]
    Search { criterion: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(
        "batch {batch_index} (UIDs {first_uid}..={last_uid}) failed after {attempts} attempts: {source}"
    )]
    BatchFetch {
        batch_index: usize,
        first_uid: Uid,
        last_uid: Uid,
        attempts: u32,
        #[source]
        source: Box<ExportError>,
    },

    #[error("cannot write '{path}': {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("credential storage error: {0}")]
    CredentialStorage(String),
}

pub type Result<T> = std::result::Result<T, ExportError>;

impl ExportError {
    pub fn output(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Output {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownProvider(_) | Self::InvalidConfig(_) | Self::FolderNotFound(_) => {
                ErrorKind::Config
            }
            Self::AuthExpired { .. } | Self::AuthFailed { .. } => ErrorKind::Auth,
            Self::ConnectTimeout { .. } | Self::Network(_) => ErrorKind::TransientNetwork,
            Self::Search { .. } | Self::Protocol(_) => ErrorKind::Protocol,
            Self::Output { .. } | Self::CredentialStorage(_) => ErrorKind::Output,
            Self::BatchFetch { source, .. } => source.kind(),
        }
    }

    /// Whether the batch fetcher may absorb this error and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. } | Self::Network(_))
    }
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        Self::Network(e.to_string())
    }
}
