//! Credential Store: static secrets for password providers, persisted and
//! refreshed tokens for OAuth2 providers.

use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use crate::auth::oauth::{OAuthEndpoint, TokenGrant};
use crate::auth::token_file::{OAuthToken, TokenFile};
use crate::error::{ExportError, Result};
use crate::providers::{AuthKind, ConnectionProfile};

/// Access tokens this close to expiry are refreshed before use.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

/// Fallback lifetime when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3500;

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Secret(String),
    OAuthToken(OAuthToken),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Secret(_) => f.write_str("Secret(<redacted>)"),
            Credential::OAuthToken(t) => f.debug_tuple("OAuthToken").field(t).finish(),
        }
    }
}

impl Credential {
    pub fn kind(&self) -> AuthKind {
        match self {
            Credential::Secret(_) => AuthKind::Password,
            Credential::OAuthToken(_) => AuthKind::OAuth2,
        }
    }
}

/// Capability set every credential store provides.
pub trait CredentialSource {
    /// Credential to use for the next connection attempt.
    fn current_credential(&self, identity: &str, profile: &ConnectionProfile)
    -> Result<Credential>;

    /// Obtain a fresh credential after the server rejected the current one.
    fn refresh(&self, identity: &str, profile: &ConnectionProfile) -> Result<Credential>;

    /// Forget whatever is stored for `identity`.
    fn invalidate(&self, identity: &str, profile: &ConnectionProfile) -> Result<()>;
}

/// Caller-supplied password or app password.
#[derive(Clone)]
pub struct StaticSecret {
    secret: String,
}

impl StaticSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl CredentialSource for StaticSecret {
    fn current_credential(&self, _: &str, _: &ConnectionProfile) -> Result<Credential> {
        Ok(Credential::Secret(self.secret.clone()))
    }

    fn refresh(&self, _: &str, _: &ConnectionProfile) -> Result<Credential> {
        Ok(Credential::Secret(self.secret.clone()))
    }

    fn invalidate(&self, _: &str, _: &ConnectionProfile) -> Result<()> {
        Ok(())
    }
}

/// Per-token-file locks shared by every [`OAuthStore`] in the process, so two
/// exports for the same mailbox never refresh concurrently.
fn identity_lock(path: PathBuf) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    locks.entry(path).or_default().clone()
}

/// OAuth2 tokens persisted per mailbox identity.
pub struct OAuthStore<E: OAuthEndpoint> {
    endpoint: E,
    tokens: TokenFile,
    margin: chrono::Duration,
}

impl<E: OAuthEndpoint> OAuthStore<E> {
    pub fn new(endpoint: E, tokens: TokenFile) -> Self {
        Self {
            endpoint,
            tokens,
            margin: chrono::Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
        }
    }

    pub fn with_margin(mut self, margin: chrono::Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Runs the interactive grant unconditionally and persists the result.
    pub fn reauthorize(&self, identity: &str) -> Result<OAuthToken> {
        let lock = identity_lock(self.tokens.path_for(identity));
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.authorize_locked(identity)
    }

    fn authorize_locked(&self, identity: &str) -> Result<OAuthToken> {
        info!("Starting OAuth2 authorization for {identity}");
        let grant = self.endpoint.authorize(identity)?;
        let token = to_token(grant, None);
        self.tokens.save(identity, &token)?;
        Ok(token)
    }

    fn refresh_locked(&self, identity: &str, stored: Option<OAuthToken>) -> Result<OAuthToken> {
        let Some(stored) = stored else {
            return self.authorize_locked(identity);
        };
        let Some(refresh_token) = stored.refresh_token.clone() else {
            debug!("No refresh token stored for {identity}; re-authorizing");
            return self.authorize_locked(identity);
        };

        info!("Refreshing OAuth2 access token for {identity}");
        let grant = self.endpoint.refresh(identity, &refresh_token)?;
        let token = to_token(grant, Some(&stored));
        self.tokens.save(identity, &token)?;
        Ok(token)
    }
}

fn to_token(grant: TokenGrant, previous: Option<&OAuthToken>) -> OAuthToken {
    let lifetime = grant
        .expires_in
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));
    OAuthToken {
        access_token: grant.access_token,
        // Refresh responses usually omit the refresh token; keep the old one.
        refresh_token: grant
            .refresh_token
            .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
        expires_at: Utc::now() + lifetime,
        scope: if grant.scope.is_empty() {
            previous.map(|p| p.scope.clone()).unwrap_or_default()
        } else {
            grant.scope
        },
    }
}

fn require_oauth(profile: &ConnectionProfile) -> Result<()> {
    if profile.auth() != AuthKind::OAuth2 {
        return Err(ExportError::InvalidConfig(format!(
            "provider '{}' does not use OAuth2",
            profile.provider()
        )));
    }
    Ok(())
}

impl<E: OAuthEndpoint> CredentialSource for OAuthStore<E> {
    fn current_credential(
        &self,
        identity: &str,
        profile: &ConnectionProfile,
    ) -> Result<Credential> {
        require_oauth(profile)?;
        let lock = identity_lock(self.tokens.path_for(identity));
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        // Read under the lock: another run may have just refreshed.
        let token = match self.tokens.load(identity)? {
            Some(t) if !t.expires_within(self.margin, Utc::now()) => t,
            stored => self.refresh_locked(identity, stored)?,
        };
        Ok(Credential::OAuthToken(token))
    }

    fn refresh(&self, identity: &str, profile: &ConnectionProfile) -> Result<Credential> {
        require_oauth(profile)?;
        let lock = identity_lock(self.tokens.path_for(identity));
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let stored = self.tokens.load(identity)?;
        Ok(Credential::OAuthToken(self.refresh_locked(identity, stored)?))
    }

    fn invalidate(&self, identity: &str, _: &ConnectionProfile) -> Result<()> {
        let lock = identity_lock(self.tokens.path_for(identity));
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.tokens.remove(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TlsMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeEndpoint {
        authorizations: AtomicUsize,
        refreshes: AtomicUsize,
        reject_refresh: bool,
    }

    impl OAuthEndpoint for FakeEndpoint {
        fn authorize(&self, _: &str) -> Result<TokenGrant> {
            let n = self.authorizations.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenGrant {
                access_token: format!("granted-{n}"),
                refresh_token: Some("refresh-1".into()),
                expires_in: Some(Duration::from_secs(3600)),
                scope: vec!["https://mail.google.com/".into()],
            })
        }

        fn refresh(&self, identity: &str, _: &str) -> Result<TokenGrant> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject_refresh {
                return Err(ExportError::AuthExpired {
                    identity: identity.to_string(),
                });
            }
            Ok(TokenGrant {
                access_token: format!("refreshed-{n}"),
                refresh_token: None,
                expires_in: Some(Duration::from_secs(3600)),
                scope: vec![],
            })
        }
    }

    fn gmail() -> ConnectionProfile {
        ConnectionProfile::new("gmail", "imap.gmail.com", 993, TlsMode::Implicit, AuthKind::OAuth2)
            .unwrap()
    }

    fn expired_token() -> OAuthToken {
        OAuthToken {
            access_token: "old".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Utc::now() - chrono::Duration::hours(1),
            scope: vec!["https://mail.google.com/".into()],
        }
    }

    #[test]
    fn static_secret_is_returned_unchanged() {
        let profile =
            ConnectionProfile::new("qq", "imap.qq.com", 993, TlsMode::Implicit, AuthKind::Password)
                .unwrap();
        let store = StaticSecret::new("hunter2");
        let cred = store.current_credential("a@qq.com", &profile).unwrap();
        assert_eq!(cred, Credential::Secret("hunter2".into()));
        assert_eq!(store.refresh("a@qq.com", &profile).unwrap(), cred);
        assert_eq!(cred.kind(), AuthKind::Password);
        assert_eq!(format!("{cred:?}"), "Secret(<redacted>)");
    }

    #[test]
    fn first_use_authorizes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = OAuthStore::new(FakeEndpoint::default(), TokenFile::new(dir.path()));

        let cred = store.current_credential("me@gmail.com", &gmail()).unwrap();
        let Credential::OAuthToken(token) = cred else {
            panic!("expected token")
        };
        assert_eq!(token.access_token, "granted-1");
        assert_eq!(store.endpoint().authorizations.load(Ordering::SeqCst), 1);

        let persisted = TokenFile::new(dir.path()).load("me@gmail.com").unwrap();
        assert_eq!(persisted, Some(token));

        // Second call reuses the persisted token.
        store.current_credential("me@gmail.com", &gmail()).unwrap();
        assert_eq!(store.endpoint().authorizations.load(Ordering::SeqCst), 1);
        assert_eq!(store.endpoint().refreshes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expired_token_is_refreshed_once() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenFile::new(dir.path());
        tokens.save("me@gmail.com", &expired_token()).unwrap();

        let store = OAuthStore::new(FakeEndpoint::default(), tokens.clone());
        let Credential::OAuthToken(token) =
            store.current_credential("me@gmail.com", &gmail()).unwrap()
        else {
            panic!("expected token")
        };

        assert_eq!(store.endpoint().refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(token.access_token, "refreshed-1");
        assert!(token.expires_at > Utc::now());
        assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(token.scope, vec!["https://mail.google.com/".to_string()]);
        assert_eq!(tokens.load("me@gmail.com").unwrap(), Some(token));
    }

    #[test]
    fn token_inside_margin_is_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenFile::new(dir.path());
        let mut t = expired_token();
        t.expires_at = Utc::now() + chrono::Duration::seconds(20);
        tokens.save("me@gmail.com", &t).unwrap();

        let store = OAuthStore::new(FakeEndpoint::default(), tokens);
        store.current_credential("me@gmail.com", &gmail()).unwrap();
        assert_eq!(store.endpoint().refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_refresh_is_auth_expired_and_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenFile::new(dir.path());
        let stale = expired_token();
        tokens.save("me@gmail.com", &stale).unwrap();
        let before = std::fs::read(tokens.path_for("me@gmail.com")).unwrap();

        let endpoint = FakeEndpoint {
            reject_refresh: true,
            ..Default::default()
        };
        let store = OAuthStore::new(endpoint, tokens.clone());
        let err = store
            .current_credential("me@gmail.com", &gmail())
            .unwrap_err();

        assert!(matches!(err, ExportError::AuthExpired { .. }));
        assert_eq!(store.endpoint().refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(store.endpoint().authorizations.load(Ordering::SeqCst), 0);
        let after = std::fs::read(tokens.path_for("me@gmail.com")).unwrap();
        assert_eq!(before, after);
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn forced_refresh_exchanges_even_when_valid() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenFile::new(dir.path());
        let mut t = expired_token();
        t.expires_at = Utc::now() + chrono::Duration::hours(1);
        tokens.save("me@gmail.com", &t).unwrap();

        let store = OAuthStore::new(FakeEndpoint::default(), tokens);
        store.refresh("me@gmail.com", &gmail()).unwrap();
        assert_eq!(store.endpoint().refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_removes_token() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenFile::new(dir.path());
        tokens.save("me@gmail.com", &expired_token()).unwrap();

        let store = OAuthStore::new(FakeEndpoint::default(), tokens.clone());
        store.invalidate("me@gmail.com", &gmail()).unwrap();
        assert!(tokens.load("me@gmail.com").unwrap().is_none());
    }

    #[test]
    fn password_profile_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = OAuthStore::new(FakeEndpoint::default(), TokenFile::new(dir.path()));
        let profile = gmail().with_auth(AuthKind::Password);
        assert!(matches!(
            store.current_credential("me@gmail.com", &profile),
            Err(ExportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn concurrent_callers_refresh_once() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenFile::new(dir.path());
        tokens.save("me@gmail.com", &expired_token()).unwrap();

        let store = Arc::new(OAuthStore::new(FakeEndpoint::default(), tokens));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.current_credential("me@gmail.com", &gmail()).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.endpoint().refreshes.load(Ordering::SeqCst), 1);
    }
}
