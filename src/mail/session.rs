//! Connection Manager: lifecycle of one authenticated session.

use log::{debug, info, warn};
use std::time::{Duration, Instant};

use crate::auth::credentials::{Credential, CredentialSource};
use crate::domain::email::{RawMessage, Uid};
use crate::error::{ExportError, Result};
use crate::mail::imap_client::{Connector, MailTransport};
use crate::mail::utf7;
use crate::providers::{AuthKind, ConnectionProfile};

pub const DEFAULT_KEEPALIVE_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    FolderSelected,
    Fetching,
    Reconnecting,
    Closing,
}

/// Owns at most one live transport. Dropping the session logs out.
pub struct MailSession<'a, C: Connector> {
    connector: &'a C,
    credentials: &'a dyn CredentialSource,
    profile: ConnectionProfile,
    identity: String,
    folder: Option<String>,
    transport: Option<C::Transport>,
    state: SessionState,
    last_activity: Instant,
    keepalive_after: Duration,
}

impl<'a, C: Connector> MailSession<'a, C> {
    pub fn new(
        connector: &'a C,
        credentials: &'a dyn CredentialSource,
        profile: ConnectionProfile,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            credentials,
            profile,
            identity: identity.into(),
            folder: None,
            transport: None,
            state: SessionState::Disconnected,
            last_activity: Instant::now(),
            keepalive_after: DEFAULT_KEEPALIVE_AFTER,
        }
    }

    pub fn with_keepalive_after(mut self, after: Duration) -> Self {
        self.keepalive_after = after;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// `Disconnected -> Connecting -> Authenticated`.
    pub fn open(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        self.state = SessionState::Connecting;
        info!(
            "Connecting to {}:{} ({:?})",
            self.profile.host(),
            self.profile.port(),
            self.profile.tls()
        );

        match self.authenticate() {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state = SessionState::Authenticated;
                self.touch();
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// An OAuth2 rejection gets exactly one refresh; a password rejection
    /// is final.
    fn authenticate(&self) -> Result<C::Transport> {
        let credential = self
            .credentials
            .current_credential(&self.identity, &self.profile)?;

        match self.connect_with(&credential) {
            Err(ExportError::AuthFailed { reason, .. })
                if self.profile.auth() == AuthKind::OAuth2 =>
            {
                warn!("Server rejected access token ({reason}); refreshing once");
                let refreshed = self.credentials.refresh(&self.identity, &self.profile)?;
                self.connect_with(&refreshed)
            }
            other => other,
        }
    }

    fn connect_with(&self, credential: &Credential) -> Result<C::Transport> {
        self.connector
            .connect(&self.profile, &self.identity, credential)
    }

    fn transport(&mut self) -> Result<&mut C::Transport> {
        self.transport
            .as_mut()
            .ok_or_else(|| ExportError::Network("session is not connected".into()))
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// `Authenticated -> FolderSelected`. The folder is remembered for
    /// reconnects.
    pub fn select(&mut self, folder: &str) -> Result<()> {
        self.transport()?.select(folder)?;
        self.folder = Some(folder.to_string());
        self.state = SessionState::FolderSelected;
        self.touch();
        Ok(())
    }

    pub fn search(&mut self, criterion: &str) -> Result<Vec<Uid>> {
        debug!("UID SEARCH {criterion}");
        let uids = self.transport()?.uid_search(criterion)?;
        self.touch();
        Ok(uids)
    }

    /// `FolderSelected -> Fetching -> FolderSelected`. A transport failure
    /// tears the socket down and leaves the session `Reconnecting`.
    pub fn fetch(&mut self, uids: &[Uid]) -> Result<Vec<RawMessage>> {
        self.state = SessionState::Fetching;
        let result = self.transport().and_then(|t| t.uid_fetch(uids));
        match &result {
            Ok(_) => {
                self.state = SessionState::FolderSelected;
                self.touch();
            }
            Err(e) if e.is_transient() => self.tear_down(),
            Err(_) => self.state = SessionState::FolderSelected,
        }
        result
    }

    /// Drops the current transport without logging out.
    fn tear_down(&mut self) {
        if self.transport.take().is_some() {
            debug!("Dropping broken connection to {}", self.profile.host());
        }
        self.state = SessionState::Reconnecting;
    }

    /// Full reconnect-and-reselect: `Reconnecting -> Connecting -> ... ->
    /// FolderSelected`.
    pub fn reconnect(&mut self) -> Result<()> {
        self.tear_down();
        info!("Reconnecting to {}", self.profile.host());
        self.open()?;
        if let Some(folder) = self.folder.clone() {
            if let Err(e) = self.select(&folder) {
                self.tear_down();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Issues NOOP when nothing has been sent for longer than the threshold.
    /// A failed NOOP only tears down the transport; the next fetch attempt
    /// reconnects.
    pub fn keepalive_if_idle(&mut self) {
        if self.transport.is_none() || self.last_activity.elapsed() < self.keepalive_after {
            return;
        }
        debug!("Idle for {:?}; sending NOOP", self.last_activity.elapsed());
        let result = self.transport().and_then(|t| t.noop());
        match result {
            Ok(()) => self.touch(),
            Err(e) => {
                warn!("Keep-alive failed: {e}");
                self.tear_down();
            }
        }
    }

    /// Decoded folder names.
    pub fn list_folders(&mut self) -> Result<Vec<String>> {
        let names = self.transport()?.list_folders()?;
        self.touch();
        Ok(names.iter().map(|n| utf7::decode(n)).collect())
    }

    /// Any state `-> Closing -> Disconnected`. Logout failures are logged and
    /// otherwise ignored.
    pub fn close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            self.state = SessionState::Disconnected;
            return;
        };
        self.state = SessionState::Closing;
        if let Err(e) = transport.logout() {
            debug!("Logout failed: {e}");
        }
        self.state = SessionState::Disconnected;
    }
}

impl<C: Connector> Drop for MailSession<'_, C> {
    fn drop(&mut self) {
        self.close();
    }
}
