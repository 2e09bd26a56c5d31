use keyring::{Entry, Error as KeyringError};

use crate::error::{ExportError, Result};

const SERVICE: &str = "imap_export";

fn entry(client_id: &str) -> Result<Entry> {
    Entry::new(SERVICE, client_id).map_err(|e| ExportError::CredentialStorage(e.to_string()))
}

/// Save an OAuth client secret into the OS keyring, keyed by client_id
pub fn save_client_secret(client_id: &str, client_secret: &str) -> Result<()> {
    entry(client_id)?
        .set_password(client_secret)
        .map_err(|e| ExportError::CredentialStorage(e.to_string()))
}

/// Load client secret from keyring by client_id
pub fn load_client_secret(client_id: &str) -> Result<Option<String>> {
    match entry(client_id)?.get_password() {
        Ok(v) => Ok(Some(v)),
        Err(KeyringError::NoEntry) => Ok(None),
        Err(e) => Err(ExportError::CredentialStorage(e.to_string())),
    }
}
