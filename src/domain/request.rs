use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ExportError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// A validated-on-demand export request, as handed over by the front-end.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Mailbox address; also the key under which OAuth tokens are persisted.
    pub mailbox: String,
    pub folder: String,
    /// Inclusive, caller-local calendar dates.
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub output_path: PathBuf,
    pub batch_size: usize,
}

impl FetchRequest {
    pub fn new(
        mailbox: impl Into<String>,
        folder: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mailbox: mailbox.into(),
            folder: folder.into(),
            start_date,
            end_date,
            output_path: output_path.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Checks the request shape. Performs no network I/O and creates no files.
    pub fn validate(&self) -> Result<()> {
        if self.end_date < self.start_date {
            return Err(ExportError::InvalidConfig(format!(
                "end date {} is before start date {}",
                self.end_date, self.start_date
            )));
        }
        if self.batch_size == 0 {
            return Err(ExportError::InvalidConfig(
                "batch size must be at least 1".into(),
            ));
        }
        if !is_valid_address(&self.mailbox) {
            return Err(ExportError::InvalidConfig(format!(
                "'{}' is not a mailbox address",
                self.mailbox
            )));
        }
        if self.folder.trim().is_empty() {
            return Err(ExportError::InvalidConfig("folder name is empty".into()));
        }
        check_writable(&self.output_path)
    }
}

/// Loose `local@domain.tld` check.
pub fn is_valid_address(address: &str) -> bool {
    let Some((local, domain)) = address.rsplit_once('@') else {
        return false;
    };
    let allowed_local = |c: char| c.is_ascii_alphanumeric() || "._%+-".contains(c);
    let allowed_domain = |c: char| c.is_ascii_alphanumeric() || ".-".contains(c);

    let tld_ok = domain
        .rsplit_once('.')
        .map(|(host, tld)| {
            !host.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
        })
        .unwrap_or(false);

    !local.is_empty()
        && local.chars().all(allowed_local)
        && domain.chars().all(allowed_domain)
        && tld_ok
}

fn check_writable(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(ExportError::InvalidConfig("output path is empty".into()));
    }
    if path.is_dir() {
        return Err(ExportError::InvalidConfig(format!(
            "output path {} is a directory",
            path.display()
        )));
    }

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let dir = fs::metadata(parent).map_err(|_| {
        ExportError::InvalidConfig(format!(
            "output directory {} does not exist",
            parent.display()
        ))
    })?;
    if !dir.is_dir() {
        return Err(ExportError::InvalidConfig(format!(
            "{} is not a directory",
            parent.display()
        )));
    }
    check_dir_accepts_files(parent)?;
    if let Ok(existing) = fs::metadata(path)
        && existing.permissions().readonly()
    {
        return Err(ExportError::InvalidConfig(format!(
            "output file {} is read-only",
            path.display()
        )));
    }
    Ok(())
}

/// Creates and removes a scratch file, which answers for the current user
/// where permission bits alone do not.
fn check_dir_accepts_files(dir: &Path) -> Result<()> {
    let scratch = dir.join(format!(".imap_export-{}.tmp", std::process::id()));
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&scratch)
    {
        Ok(file) => {
            drop(file);
            let _ = fs::remove_file(&scratch);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(ExportError::InvalidConfig(format!(
            "cannot create files in output directory {}: {e}",
            dir.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn request_in(dir: &Path) -> FetchRequest {
        FetchRequest::new(
            "someone@example.com",
            "INBOX",
            date(2024, 1, 1),
            date(2024, 1, 31),
            dir.join("out.csv"),
        )
    }

    #[test]
    fn default_batch_size_is_fifty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(request_in(dir.path()).batch_size, 50);
    }

    #[test]
    fn accepts_well_formed_request() {
        let dir = tempfile::tempdir().unwrap();
        request_in(dir.path()).validate().unwrap();
    }

    #[test]
    fn rejects_reversed_dates() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request_in(dir.path());
        req.start_date = date(2024, 2, 1);
        let err = req.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn same_day_range_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request_in(dir.path());
        req.end_date = req.start_date;
        req.validate().unwrap();
    }

    #[test]
    fn rejects_zero_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let req = request_in(dir.path()).with_batch_size(0);
        assert!(matches!(req.validate(), Err(ExportError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_missing_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request_in(dir.path());
        req.output_path = dir.path().join("nope").join("out.csv");
        assert!(matches!(req.validate(), Err(ExportError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_directory_as_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request_in(dir.path());
        req.output_path = dir.path().to_path_buf();
        assert!(req.validate().is_err());
    }

    #[test]
    fn address_check() {
        assert!(is_valid_address("user.name+tag@mail.example.org"));
        assert!(!is_valid_address("no-at-sign"));
        assert!(!is_valid_address("@example.com"));
        assert!(!is_valid_address("user@localhost"));
        assert!(!is_valid_address("user@example.c"));
    }

    #[test]
    fn validation_leaves_no_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        request_in(dir.path()).validate().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn rejects_directory_the_user_cannot_write() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        // Privileged users bypass mode bits; nothing to check then.
        let privileged = fs::write(locked.join("x"), b"").is_ok();
        let mut req = request_in(dir.path());
        req.output_path = locked.join("out.csv");
        let result = req.validate();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        if !privileged {
            assert!(matches!(result, Err(ExportError::InvalidConfig(_))));
        }
    }
}
