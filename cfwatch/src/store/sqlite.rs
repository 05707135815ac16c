//! The authoritative SQLite backend.

use crate::account::PersistedConfig;
use crate::store::{AccountRecord, StoreError};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use std::path::Path;

pub(crate) struct SqliteBackend {
    // A single connection behind a mutex: writers never interleave
    // statements, and the save transaction is all-or-nothing.
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS accounts (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL UNIQUE,
                 email TEXT,
                 key TEXT,
                 api_token TEXT,
                 account_id TEXT,
                 account_id_cache TEXT,
                 cache_update_time TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_accounts_name ON accounts(name);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Read the full config. `None` when the accounts table is empty, which
    /// tells the caller to consult the mirror.
    pub fn load(&self) -> Result<Option<PersistedConfig>, StoreError> {
        let conn = self.conn.lock();
        let mut cfg = PersistedConfig::default();

        let mut stmt = conn.prepare("SELECT key, value FROM config")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            match key.as_str() {
                "proxy" => {
                    if let Ok(proxy) = serde_json::from_str(&value) {
                        cfg.proxy = proxy;
                    }
                }
                "refresh_interval" => {
                    if let Ok(secs) = value.parse() {
                        cfg.policy.interval_secs = secs;
                    }
                }
                "request_limit" => {
                    if let Ok(limit) = value.parse() {
                        cfg.policy.daily_request_limit = limit;
                    }
                }
                _ => {}
            }
        }
        cfg.policy = cfg.policy.clamped();

        let mut stmt = conn.prepare(
            "SELECT name, email, key, api_token, account_id, account_id_cache, cache_update_time
             FROM accounts ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AccountRecord {
                name: row.get(0)?,
                email: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                key: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                api_token: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                account_id: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                account_id_cache: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                cache_update_time: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            })
        })?;
        let mut accounts = Vec::new();
        for record in rows {
            accounts.push(record?.into_account());
        }
        if accounts.is_empty() {
            return Ok(None);
        }
        cfg.accounts = accounts;
        Ok(Some(cfg))
    }

    /// Replace both tables in one transaction: delete-then-bulk-insert keeps
    /// the save all-or-nothing and the stored order equal to list order.
    pub fn save(&self, cfg: &PersistedConfig) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM config", [])?;
        tx.execute("DELETE FROM accounts", [])?;

        let proxy_json = serde_json::to_string(&cfg.proxy)?;
        {
            let mut stmt = tx.prepare("INSERT INTO config (key, value) VALUES (?1, ?2)")?;
            stmt.execute(params!["proxy", proxy_json])?;
            stmt.execute(params!["refresh_interval", cfg.policy.interval_secs.to_string()])?;
            stmt.execute(params!["request_limit", cfg.policy.daily_request_limit.to_string()])?;
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO accounts
                     (name, email, key, api_token, account_id, account_id_cache, cache_update_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for account in &cfg.accounts {
                let record = AccountRecord::from(account);
                stmt.execute(params![
                    record.name,
                    record.email,
                    record.key,
                    record.api_token,
                    record.account_id,
                    record.account_id_cache,
                    record.cache_update_time,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
