use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ExportError, Result};

/// Persisted OAuth2 grant for one mailbox identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: Vec<String>,
}

impl std::fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthToken")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

impl OAuthToken {
    /// True when the access token is expired or expires within `margin`.
    pub fn expires_within(&self, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + margin
    }
}

/// One JSON file per mailbox identity inside `dir`.
#[derive(Debug, Clone)]
pub struct TokenFile {
    dir: PathBuf,
}

impl TokenFile {
    /// The directory is resolved to an absolute path up front, so every
    /// spelling of it shares one refresh lock per identity.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let dir = fs::canonicalize(&dir)
            .or_else(|_| std::path::absolute(&dir))
            .unwrap_or(dir);
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, identity: &str) -> PathBuf {
        let name: String = identity
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || "@._-".contains(c) {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    pub fn load(&self, identity: &str) -> Result<Option<OAuthToken>> {
        let path = self.path_for(identity);
        if !path.exists() {
            return Ok(None);
        }
        let s = fs::read_to_string(&path).map_err(|e| storage_error(&path, e))?;
        let token = serde_json::from_str(&s).map_err(|e| {
            ExportError::CredentialStorage(format!("{} is not a token file: {e}", path.display()))
        })?;
        Ok(Some(token))
    }

    /// Writes the token next to its final path and renames it into place, so
    /// a crash never leaves a truncated file behind.
    pub fn save(&self, identity: &str, token: &OAuthToken) -> Result<()> {
        create_private_dir(&self.dir)?;
        let path = self.path_for(identity);
        let tmp = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(token)
            .map_err(|e| ExportError::CredentialStorage(e.to_string()))?;

        let mut file = open_private(&tmp).map_err(|e| storage_error(&tmp, e))?;
        file.write_all(&data)
            .and_then(|_| file.sync_all())
            .map_err(|e| storage_error(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| storage_error(&path, e))?;
        debug!("Persisted OAuth token to {}", path.display());
        Ok(())
    }

    pub fn remove(&self, identity: &str) -> Result<()> {
        let path = self.path_for(identity);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&path, e)),
        }
    }
}

fn storage_error(path: &Path, e: std::io::Error) -> ExportError {
    ExportError::CredentialStorage(format!("{}: {e}", path.display()))
}

fn create_private_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| storage_error(dir, e))
}

fn open_private(path: &Path) -> std::io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600); // rw-------
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> OAuthToken {
        OAuthToken {
            access_token: "ya29.access".into(),
            refresh_token: Some("1//refresh".into()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            scope: vec!["https://mail.google.com/".into()],
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenFile::new(dir.path().join("tokens"));
        assert!(store.load("me@gmail.com").unwrap().is_none());

        let t = token();
        store.save("me@gmail.com", &t).unwrap();
        assert_eq!(store.load("ME@gmail.com").unwrap(), Some(t));
        assert!(!store.path_for("me@gmail.com").with_extension("json.tmp").exists());
    }

    #[test]
    fn directory_spellings_resolve_to_one_path() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = dir.path().join("tokens");
        fs::create_dir(&tokens).unwrap();

        let plain = TokenFile::new(&tokens);
        let roundabout = TokenFile::new(tokens.join("..").join("tokens"));
        assert_eq!(plain.path_for("me@gmail.com"), roundabout.path_for("me@gmail.com"));
        assert!(TokenFile::new("not-yet-created").dir().is_absolute());
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = TokenFile::new(dir.path());
        store.save("me@gmail.com", &token()).unwrap();
        let mode = fs::metadata(store.path_for("me@gmail.com"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn identities_map_to_distinct_safe_names() {
        let store = TokenFile::new("/tmp/tokens");
        let a = store.path_for("a@example.com");
        let b = store.path_for("b@example.com");
        assert_ne!(a, b);
        let odd = store.path_for("../../etc/passwd@x.com");
        assert_eq!(odd.parent(), Some(Path::new("/tmp/tokens")));
    }

    #[test]
    fn remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        TokenFile::new(dir.path()).remove("nobody@example.com").unwrap();
    }

    #[test]
    fn expiry_margin() {
        let now = Utc::now();
        let mut t = token();
        t.expires_at = now + chrono::Duration::seconds(30);
        assert!(t.expires_within(chrono::Duration::seconds(60), now));
        t.expires_at = now + chrono::Duration::seconds(600);
        assert!(!t.expires_within(chrono::Duration::seconds(60), now));
    }
}
