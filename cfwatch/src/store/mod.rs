//! Dual-backend persistence: an authoritative SQLite database mirrored into
//! a flat JSON file. The mirror is a best-effort backup and doubles as the
//! import source for config files written by older releases.

mod mirror;
mod sqlite;

use crate::account::{Account, Credentials, PersistedConfig, ProxyConfig, RefreshPolicy};
use crate::account::{DEFAULT_REFRESH_SECS, DEFAULT_REQUEST_LIMIT};
use chrono::{DateTime, NaiveDateTime, Utc};
use mirror::JsonMirror;
use serde::{Deserialize, Serialize};
use sqlite::SqliteBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Flat on-disk account layout shared by the accounts table and the JSON
/// mirror. Empty strings stand in for unset fields, as older config files
/// wrote them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AccountRecord {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub account_id_cache: String,
    #[serde(default)]
    pub cache_update_time: String,
}

impl From<&Account> for AccountRecord {
    fn from(account: &Account) -> Self {
        let (email, key, api_token) = match &account.credentials {
            Credentials::GlobalKey { email, key } => (email.clone(), key.clone(), String::new()),
            Credentials::ApiToken { token } => (String::new(), String::new(), token.clone()),
        };
        Self {
            name: account.name.clone(),
            email,
            key,
            api_token,
            account_id: account.account_id.clone().unwrap_or_default(),
            account_id_cache: account.cached_account_id.clone().unwrap_or_default(),
            cache_update_time: account
                .cache_updated_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        }
    }
}

impl AccountRecord {
    pub(crate) fn into_account(self) -> Account {
        let credentials = if !self.api_token.is_empty() {
            Credentials::ApiToken { token: self.api_token }
        } else {
            Credentials::GlobalKey { email: self.email, key: self.key }
        };
        Account {
            name: self.name,
            credentials,
            account_id: none_if_empty(self.account_id),
            cached_account_id: none_if_empty(self.account_id_cache),
            cache_updated_at: parse_cache_time(&self.cache_update_time),
        }
    }
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Accepts RFC 3339 as written by this program and the offset-less ISO form
/// found in older config files (treated as UTC).
pub(crate) fn parse_cache_time(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

/// The mirror file as one JSON document.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ConfigDoc {
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default = "default_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_limit")]
    pub request_limit: u64,
}

fn default_interval() -> u64 {
    DEFAULT_REFRESH_SECS
}

fn default_limit() -> u64 {
    DEFAULT_REQUEST_LIMIT
}

impl From<&PersistedConfig> for ConfigDoc {
    fn from(cfg: &PersistedConfig) -> Self {
        Self {
            accounts: cfg.accounts.iter().map(AccountRecord::from).collect(),
            proxy: cfg.proxy.clone(),
            refresh_interval: cfg.policy.interval_secs,
            request_limit: cfg.policy.daily_request_limit,
        }
    }
}

impl ConfigDoc {
    pub(crate) fn into_config(self) -> PersistedConfig {
        PersistedConfig {
            proxy: self.proxy,
            policy: RefreshPolicy {
                interval_secs: self.refresh_interval,
                daily_request_limit: self.request_limit,
            }
            .clamped(),
            accounts: self.accounts.into_iter().map(AccountRecord::into_account).collect(),
        }
    }
}

/// Durable storage for [`PersistedConfig`]. SQLite is authoritative when it
/// holds any accounts; the JSON mirror is consulted only then, and migrated
/// back into SQLite on first contact.
pub struct ConfigStore {
    sqlite: SqliteBackend,
    mirror: Arc<JsonMirror>,
}

impl ConfigStore {
    pub fn open(db_path: &Path, mirror_path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            sqlite: SqliteBackend::open(db_path)?,
            mirror: Arc::new(JsonMirror::new(mirror_path)),
        })
    }

    /// Default data directory, `~/.cfwatch`.
    pub fn default_dir() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".cfwatch")
    }

    pub fn open_default() -> Result<Self, StoreError> {
        let dir = Self::default_dir();
        Self::open(&dir.join("cfwatch.db"), &dir.join("cfwatch.json"))
    }

    /// Load the persisted config, falling back SQLite -> mirror -> defaults.
    /// Mirror data found while SQLite is empty is migrated into SQLite.
    pub fn load(&self) -> PersistedConfig {
        let sqlite_usable = match self.sqlite.load() {
            Ok(Some(cfg)) => return cfg,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!("sqlite load failed, trying the mirror: {e}");
                false
            }
        };
        match self.mirror.load() {
            Ok(Some(cfg)) => {
                if sqlite_usable {
                    if let Err(e) = self.migrate_legacy(&cfg) {
                        tracing::warn!("migration of mirror data into sqlite failed: {e}");
                    }
                }
                cfg
            }
            Ok(None) => PersistedConfig::default(),
            Err(e) => {
                tracing::warn!("mirror load failed, starting from defaults: {e}");
                PersistedConfig::default()
            }
        }
    }

    /// Persist the config: one SQLite transaction, then a detached
    /// best-effort write of the mirror.
    pub fn save(&self, cfg: &PersistedConfig) -> Result<(), StoreError> {
        self.sqlite.save(cfg)?;
        self.write_mirror_detached(cfg);
        Ok(())
    }

    /// One-shot import of mirror data into the authoritative backend.
    pub fn migrate_legacy(&self, cfg: &PersistedConfig) -> Result<(), StoreError> {
        tracing::info!(accounts = cfg.accounts.len(), "migrating mirror config into sqlite");
        self.sqlite.save(cfg)
    }

    // The mirror is a convenience backup, not the source of truth: its
    // failures are logged and swallowed, and the write happens off the
    // caller's thread.
    fn write_mirror_detached(&self, cfg: &PersistedConfig) {
        let mirror = Arc::clone(&self.mirror);
        let detached = cfg.clone();
        let spawned = std::thread::Builder::new()
            .name("cfwatch-mirror".into())
            .spawn(move || {
                if let Err(e) = mirror.save(&detached) {
                    tracing::warn!("mirror write failed: {e}");
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("mirror writer thread unavailable ({e}), writing inline");
            if let Err(e) = self.mirror.save(cfg) {
                tracing::warn!("mirror write failed: {e}");
            }
        }
    }
}
