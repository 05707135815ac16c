//! Flat-file JSON mirror: a best-effort backup of the SQLite contents and
//! the read path for config files written by older releases.

use crate::account::PersistedConfig;
use crate::store::{ConfigDoc, StoreError};
use fs2::FileExt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

pub(crate) struct JsonMirror {
    path: PathBuf,
}

impl JsonMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn lock_path(&self) -> PathBuf {
        // A sibling lock file (avoids locking the mirror itself during the
        // atomic replace).
        self.path.with_extension("json.lock")
    }

    fn with_exclusive_lock<T>(
        &self,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.lock_path())?;
        lock_file.lock_exclusive()?;
        let out = f();
        let _ = FileExt::unlock(&lock_file);
        out
    }

    /// Read the mirror. `None` when the file does not exist.
    pub fn load(&self) -> Result<Option<PersistedConfig>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        self.with_exclusive_lock(|| {
            let content = fs::read_to_string(&self.path)?;
            let doc: ConfigDoc = serde_json::from_str(&content)?;
            Ok(Some(doc.into_config()))
        })
    }

    /// Write the mirror atomically (temp file in the same directory, then
    /// rename).
    pub fn save(&self, cfg: &PersistedConfig) -> Result<(), StoreError> {
        self.with_exclusive_lock(|| {
            let json = serde_json::to_string_pretty(&ConfigDoc::from(cfg))?;
            let tmp_path = self.path.with_extension("json.tmp");
            {
                let mut file = fs::File::create(&tmp_path)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
            }
            fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, Credentials};

    #[test]
    fn mirror_round_trips_through_the_document_format() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = JsonMirror::new(dir.path().join("cfg.json"));

        let cfg = PersistedConfig {
            accounts: vec![Account {
                name: "acme".into(),
                credentials: Credentials::ApiToken { token: "tok".into() },
                account_id: None,
                cached_account_id: None,
                cache_updated_at: None,
            }],
            ..Default::default()
        };
        mirror.save(&cfg).unwrap();
        assert_eq!(mirror.load().unwrap(), Some(cfg));
    }

    #[test]
    fn missing_mirror_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = JsonMirror::new(dir.path().join("cfg.json"));
        assert_eq!(mirror.load().unwrap(), None);
    }
}
