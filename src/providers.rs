//! Provider presets and resolution of a provider key to a [`ConnectionProfile`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ExportError, Result};

pub const CUSTOM_PROVIDER: &str = "custom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Password,
    #[serde(rename = "oauth2")]
    OAuth2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// TLS from the first byte (usually port 993).
    Implicit,
    /// Plaintext greeting upgraded with STARTTLS.
    StartTls,
    Plain,
}

impl TlsMode {
    pub fn uses_tls(self) -> bool {
        !matches!(self, TlsMode::Plain)
    }
}

/// OAuth2 endpoints of a provider that requires OAuth2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

/// One row of the provider table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    pub auth: AuthKind,
    #[serde(default)]
    pub domain_patterns: Vec<String>,
    #[serde(default)]
    pub oauth: Option<OAuthEndpoints>,
}

/// Explicit server fields for the `custom` provider.
///
/// `port` is wider than `u16` so out-of-range input can be reported instead
/// of silently wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomServer {
    pub host: String,
    pub port: u32,
    pub tls: TlsMode,
    pub auth: AuthKind,
}

/// Resolved, immutable connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    provider: String,
    host: String,
    port: u16,
    tls: TlsMode,
    auth: AuthKind,
}

impl ConnectionProfile {
    pub fn new(
        provider: impl Into<String>,
        host: impl Into<String>,
        port: u32,
        tls: TlsMode,
        auth: AuthKind,
    ) -> Result<Self> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(ExportError::InvalidConfig("server host is empty".into()));
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| {
                ExportError::InvalidConfig(format!("port {port} is outside 1..=65535"))
            })?;
        Ok(Self {
            provider: provider.into(),
            host,
            port,
            tls,
            auth,
        })
    }

    /// Same server, different authentication kind (e.g. an app password on a
    /// provider whose preset is OAuth2).
    pub fn with_auth(mut self, auth: AuthKind) -> Self {
        self.auth = auth;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tls(&self) -> TlsMode {
        self.tls
    }

    pub fn use_tls(&self) -> bool {
        self.tls.uses_tls()
    }

    pub fn auth(&self) -> AuthKind {
        self.auth
    }
}

#[derive(Debug, Clone)]
pub struct ProviderTable {
    entries: BTreeMap<String, ProviderEntry>,
}

impl Default for ProviderTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn entry(
    display_name: &str,
    host: &str,
    auth: AuthKind,
    domains: &[&str],
    oauth: Option<OAuthEndpoints>,
) -> ProviderEntry {
    ProviderEntry {
        display_name: display_name.to_string(),
        host: host.to_string(),
        port: 993,
        tls: TlsMode::Implicit,
        auth,
        domain_patterns: domains.iter().map(|d| d.to_string()).collect(),
        oauth,
    }
}

impl ProviderTable {
    pub fn builtin() -> Self {
        let google = OAuthEndpoints {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec!["https://mail.google.com/".to_string()],
        };

        let mut entries = BTreeMap::new();
        entries.insert(
            "163".to_string(),
            entry(
                "163 Mail",
                "imap.163.com",
                AuthKind::Password,
                &["163.com", "126.com", "yeah.net"],
                None,
            ),
        );
        entries.insert(
            "gmail".to_string(),
            entry(
                "Gmail",
                "imap.gmail.com",
                AuthKind::OAuth2,
                &["gmail.com", "googlemail.com"],
                Some(google),
            ),
        );
        entries.insert(
            "qq".to_string(),
            entry(
                "QQ Mail",
                "imap.qq.com",
                AuthKind::Password,
                &["qq.com", "foxmail.com"],
                None,
            ),
        );
        entries.insert(
            "outlook".to_string(),
            entry(
                "Outlook/Hotmail",
                "outlook.office365.com",
                AuthKind::Password,
                &["outlook.com", "hotmail.com", "live.com", "msn.com"],
                None,
            ),
        );
        entries.insert(
            "yahoo".to_string(),
            entry(
                "Yahoo Mail",
                "imap.mail.yahoo.com",
                AuthKind::Password,
                &["yahoo.com", "yahoo.cn", "ymail.com"],
                None,
            ),
        );
        Self { entries }
    }

    /// Adds or replaces entries. A key of `custom` is refused since it names
    /// the explicit-fields path.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, ProviderEntry>) -> Result<Self> {
        for (key, entry) in overrides {
            let key = key.to_ascii_lowercase();
            if key == CUSTOM_PROVIDER {
                return Err(ExportError::InvalidConfig(
                    "'custom' cannot be redefined in the provider table".into(),
                ));
            }
            self.entries.insert(key, entry.clone());
        }
        Ok(self)
    }

    /// Key/entry pairs in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ProviderEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&ProviderEntry> {
        self.entries.get(&key.to_ascii_lowercase())
    }

    /// Maps a provider key (or `custom` plus explicit fields) to a profile.
    /// Pure: no network I/O.
    pub fn resolve(&self, key: &str, custom: Option<&CustomServer>) -> Result<ConnectionProfile> {
        let key = key.trim().to_ascii_lowercase();
        if key == CUSTOM_PROVIDER {
            let custom = custom.ok_or_else(|| {
                ExportError::InvalidConfig("custom provider needs host and port".into())
            })?;
            return ConnectionProfile::new(
                CUSTOM_PROVIDER,
                custom.host.clone(),
                custom.port,
                custom.tls,
                custom.auth,
            );
        }

        let entry = self
            .entries
            .get(&key)
            .ok_or_else(|| ExportError::UnknownProvider(key.clone()))?;
        ConnectionProfile::new(
            key.clone(),
            entry.host.clone(),
            u32::from(entry.port),
            entry.tls,
            entry.auth,
        )
    }

    /// Finds the provider key whose domain patterns contain the address's domain.
    pub fn detect(&self, address: &str) -> Option<&str> {
        let (_, domain) = address.rsplit_once('@')?;
        let domain = domain.trim().to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(_, entry)| {
                entry
                    .domain_patterns
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(&domain))
            })
            .map(|(key, _)| key.as_str())
    }
}
