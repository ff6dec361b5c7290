//! Employee id → email directory, persisted as a flat JSON object.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const CONTACTS_FILE_NAME: &str = "user_emails.json";

#[derive(Error, Debug)]
pub enum ContactsError {
    #[error("contact directory I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("contact directory encode: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct ContactDirectory {
    path: PathBuf,
    emails: Mutex<BTreeMap<String, String>>,
}

impl ContactDirectory {
    /// Load `user_emails.json` from `dir`. A missing file is an empty
    /// directory; a corrupt one is logged and replaced on the next save.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(CONTACTS_FILE_NAME);
        let emails = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "invalid JSON in email storage; starting fresh");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read email storage; starting fresh");
                BTreeMap::new()
            }
        };
        tracing::debug!(entries = emails.len(), "contact directory loaded");
        Self {
            path,
            emails: Mutex::new(emails),
        }
    }

    pub fn email_for(&self, employee_id: &str) -> Option<String> {
        self.lock().get(employee_id).cloned()
    }

    /// Record an address and rewrite the whole file.
    pub fn save(&self, employee_id: &str, email: &str) -> Result<(), ContactsError> {
        let mut emails = self.lock();
        emails.insert(employee_id.to_string(), email.to_string());
        let encoded = serde_json::to_string_pretty(&*emails)?;
        fs::write(&self.path, encoded).map_err(|source| ContactsError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.emails.lock().unwrap_or_else(|e| e.into_inner())
    }
}
