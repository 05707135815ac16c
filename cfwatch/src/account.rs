//! Core configuration types: accounts, credentials, proxy, refresh policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

pub const MIN_REFRESH_SECS: u64 = 30;
pub const MAX_REFRESH_SECS: u64 = 3600;
pub const DEFAULT_REFRESH_SECS: u64 = 300;
pub const DEFAULT_REQUEST_LIMIT: u64 = 200_000;

/// How an account authenticates against the API. Exactly one mode is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Account email plus the global API key.
    GlobalKey { email: String, key: String },
    /// A scoped API token.
    ApiToken { token: String },
}

impl Credentials {
    /// True when the active mode has all of its fields filled in. Entries
    /// imported from older config files may carry empty strings.
    pub fn is_usable(&self) -> bool {
        match self {
            Credentials::GlobalKey { email, key } => !email.is_empty() && !key.is_empty(),
            Credentials::ApiToken { token } => !token.is_empty(),
        }
    }

    /// The email tied to these credentials, if the mode carries one.
    pub fn email(&self) -> Option<&str> {
        match self {
            Credentials::GlobalKey { email, .. } => Some(email.as_str()),
            Credentials::ApiToken { .. } => None,
        }
    }
}

/// A registered account. `name` is the unique, stable key across the system.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub name: String,
    pub credentials: Credentials,
    /// Explicit account id; skips resolution entirely when set.
    pub account_id: Option<String>,
    /// Last id returned by the accounts endpoint.
    pub cached_account_id: Option<String>,
    /// When the cached id was resolved. The cache is trusted for 24 hours.
    pub cache_updated_at: Option<DateTime<Utc>>,
}

/// Caller-supplied fields for creating or replacing an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub credentials: Credentials,
    pub account_id: Option<String>,
}

/// Outbound proxy settings. Field names follow the on-disk config document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "enable", default)]
    pub enabled: bool,
    /// http, https or socks5.
    #[serde(rename = "type", default)]
    pub scheme: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, deserialize_with = "de_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ProxyConfig {
    /// Proxy URL for outbound calls, or `None` when disabled or incomplete.
    /// Credentials are applied separately via [`ProxyConfig::basic_auth`].
    pub fn url(&self) -> Option<String> {
        if !self.enabled || self.host.is_empty() || self.port == 0 {
            return None;
        }
        let scheme = if self.scheme.is_empty() { "http" } else { self.scheme.as_str() };
        Some(format!("{}://{}:{}", scheme, self.host, self.port))
    }

    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() || self.password.is_empty() {
            None
        } else {
            Some((self.username.as_str(), self.password.as_str()))
        }
    }
}

// Older config files wrote the port as a string.
fn de_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u16),
        Text(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n,
        Raw::Text(s) => s.trim().parse().unwrap_or(0),
    })
}

/// Refresh cadence and the daily display threshold. The threshold is used by
/// consumers for percent-of-limit readouts; it is never enforced remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub interval_secs: u64,
    pub daily_request_limit: u64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_REFRESH_SECS,
            daily_request_limit: DEFAULT_REQUEST_LIMIT,
        }
    }
}

impl RefreshPolicy {
    /// Bound the interval to [30, 3600] seconds.
    pub fn clamped(mut self) -> Self {
        self.interval_secs = self.interval_secs.clamp(MIN_REFRESH_SECS, MAX_REFRESH_SECS);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.clamp(MIN_REFRESH_SECS, MAX_REFRESH_SECS))
    }
}

/// Everything the engine persists: proxy, policy and the ordered accounts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedConfig {
    pub proxy: ProxyConfig,
    pub policy: RefreshPolicy,
    pub accounts: Vec<Account>,
}
