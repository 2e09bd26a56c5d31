use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::oauth::DEFAULT_REDIRECT_URI;
use crate::auth::token_store;
use crate::domain::request::DEFAULT_BATCH_SIZE;
use crate::engine::EngineSettings;
use crate::mail::decoders::{DEFAULT_PROBES, ProbeList};
use crate::mail::fetcher::RetryPolicy;
use crate::mail::imap_client::ImapConnector;
use crate::providers::{ProviderEntry, ProviderTable};

const APP_DIR: &str = "imap_export";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct OAuthSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub keepalive_after_secs: u64,
    pub charset_probes: Vec<String>,
    pub token_dir: Option<PathBuf>,
    pub excel_bom: bool,
    pub oauth: OAuthSettings,
    /// Added to, or replacing, the built-in provider table.
    pub providers: BTreeMap<String, ProviderEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: 3,
            backoff_base_secs: 1,
            connect_timeout_secs: 30,
            io_timeout_secs: 60,
            keepalive_after_secs: 120,
            charset_probes: DEFAULT_PROBES.iter().map(|s| s.to_string()).collect(),
            token_dir: None,
            excel_bom: false,
            oauth: OAuthSettings::default(),
            providers: BTreeMap::new(),
        }
    }
}

fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("no config dir available"))?
        .join(APP_DIR))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config file; a missing file means defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };
    if !path.exists() {
        debug!("No config at {}; using defaults", path.display());
        return Ok(Config::default());
    }
    let s = fs::read_to_string(&path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&s).with_context(|| format!("invalid config {}", path.display()))?;
    cfg.check()?;
    Ok(cfg)
}

const TEMPLATE_HEADER: &str = "\
# imap_export configuration.
#
# [oauth] is only needed for providers that sign in with OAuth2 (gmail).
# The client secret may instead be stored with `imap_export set-client-secret`
# or passed in OAUTH_CLIENT_SECRET.
#
# Extra providers can be added as tables, e.g.
#
# [providers.corp]
# display_name = \"Corp Mail\"
# host = \"imap.corp.example\"
# port = 993
# tls = \"implicit\"        # implicit | starttls | plain
# auth = \"password\"       # password | oauth2
# domain_patterns = [\"corp.example\"]

";

/// Writes a template config. Refuses to overwrite an existing file.
pub fn write_template(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let sample = Config {
        oauth: OAuthSettings {
            client_id: Some("YOUR_CLIENT_ID.apps.googleusercontent.com".to_string()),
            client_secret: None,
            redirect_uri: Some(DEFAULT_REDIRECT_URI.to_string()),
        },
        ..Config::default()
    };
    let body = toml::to_string_pretty(&sample)?;
    fs::write(&path, format!("{TEMPLATE_HEADER}{body}"))?;
    Ok(path)
}

impl Config {
    fn check(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn provider_table(&self) -> Result<ProviderTable> {
        Ok(ProviderTable::builtin().with_overrides(&self.providers)?)
    }

    pub fn probe_list(&self) -> Result<ProbeList> {
        Ok(ProbeList::from_labels(&self.charset_probes)?)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            retry: RetryPolicy::new(
                self.max_attempts,
                Duration::from_secs(self.backoff_base_secs),
            ),
            keepalive_after: Duration::from_secs(self.keepalive_after_secs),
            excel_bom: self.excel_bom,
        }
    }

    pub fn connector(&self) -> ImapConnector {
        ImapConnector::new(
            Duration::from_secs(self.connect_timeout_secs),
            Duration::from_secs(self.io_timeout_secs),
        )
    }

    pub fn token_dir(&self) -> Result<PathBuf> {
        match &self.token_dir {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("tokens")),
        }
    }

    /// Client secret from the config file, else from the OS keyring.
    pub fn client_secret(&self, client_id: &str) -> Result<Option<String>> {
        if let Some(secret) = &self.oauth.client_secret {
            return Ok(Some(secret.clone()));
        }
        Ok(token_store::load_client_secret(client_id)?)
    }
}
