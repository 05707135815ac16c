//! The usage-source seam: one bounded remote query for one account.

use crate::account::{Account, ProxyConfig};
use crate::api::{CfClient, DEFAULT_BASE_URL, UsageError, UsageResult};
use crate::registry::AccountRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Fetches the current usage readout for a single account. Implementations
/// never escape with a raw error; every failure path produces an
/// error-bearing result.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn fetch(&self, account: &Account) -> UsageResult;
}

/// The real source: resolves the account id (with registry write-back for
/// fresh resolutions) and runs the usage query against the Cloudflare API.
pub struct CloudflareSource {
    registry: Arc<AccountRegistry>,
    base_url: String,
    // Client for the current proxy settings, rebuilt when they change.
    client: Mutex<Option<(ProxyConfig, CfClient)>>,
}

impl CloudflareSource {
    pub fn new(registry: Arc<AccountRegistry>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, registry)
    }

    pub fn with_base_url(base_url: impl Into<String>, registry: Arc<AccountRegistry>) -> Self {
        Self { registry, base_url: base_url.into(), client: Mutex::new(None) }
    }

    fn client(&self) -> Result<CfClient, UsageError> {
        let proxy = self.registry.proxy();
        let mut cached = self.client.lock();
        if let Some((cached_proxy, client)) = cached.as_ref() {
            if *cached_proxy == proxy {
                return Ok(client.clone());
            }
        }
        let client = CfClient::with_base_url(&self.base_url, &proxy)
            .map_err(|e| UsageError::Query(format!("client setup failed: {e}")))?;
        *cached = Some((proxy, client.clone()));
        Ok(client)
    }
}

#[async_trait]
impl UsageSource for CloudflareSource {
    async fn fetch(&self, account: &Account) -> UsageResult {
        if !account.credentials.is_usable() {
            return Err(UsageError::Credentials);
        }
        let client = self.client()?;

        let account_id = match &account.account_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let cached =
                    account.cached_account_id.as_deref().zip(account.cache_updated_at);
                let resolved =
                    client.resolve_account_id(&account.credentials, cached).await?;
                if resolved.refreshed {
                    self.registry.record_resolved_id(&account.name, &resolved.id);
                }
                resolved.id
            }
        };

        client.query_usage(&account.credentials, &account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Credentials, NewAccount};
    use crate::store::ConfigStore;
    use chrono::Utc;

    fn offline_source() -> (tempfile::TempDir, Arc<AccountRegistry>, CloudflareSource) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("cfg.db"), &dir.path().join("cfg.json"))
            .unwrap();
        let registry = Arc::new(AccountRegistry::load(Arc::new(store)));
        // Nothing listens on this port; network attempts fail fast.
        let source = CloudflareSource::with_base_url("http://127.0.0.1:1", Arc::clone(&registry));
        (dir, registry, source)
    }

    fn account(name: &str) -> Account {
        Account {
            name: name.into(),
            credentials: Credentials::ApiToken { token: "tok".into() },
            account_id: None,
            cached_account_id: None,
            cache_updated_at: None,
        }
    }

    #[tokio::test]
    async fn unusable_credentials_fail_before_any_network_call() {
        let (_dir, _registry, source) = offline_source();
        let mut acct = account("a");
        acct.credentials = Credentials::ApiToken { token: String::new() };
        assert!(matches!(source.fetch(&acct).await, Err(UsageError::Credentials)));
    }

    #[tokio::test]
    async fn preset_account_id_skips_resolution() {
        let (_dir, _registry, source) = offline_source();
        let mut acct = account("a");
        acct.account_id = Some("explicit".into());
        // The failure comes from the usage query, proving the accounts
        // endpoint was never consulted.
        assert!(matches!(source.fetch(&acct).await, Err(UsageError::Query(_))));
    }

    #[tokio::test]
    async fn missing_account_id_fails_at_resolution() {
        let (_dir, _registry, source) = offline_source();
        assert!(matches!(source.fetch(&account("a")).await, Err(UsageError::Resolution(_))));
    }

    #[tokio::test]
    async fn fresh_cached_id_reaches_the_usage_query() {
        let (_dir, _registry, source) = offline_source();
        let mut acct = account("a");
        acct.cached_account_id = Some("cached".into());
        acct.cache_updated_at = Some(Utc::now());
        assert!(matches!(source.fetch(&acct).await, Err(UsageError::Query(_))));
    }

    #[tokio::test]
    async fn proxy_change_rebuilds_the_client() {
        let (_dir, registry, source) = offline_source();
        registry
            .add(NewAccount {
                name: "a".into(),
                credentials: Credentials::ApiToken { token: "tok".into() },
                account_id: None,
            })
            .unwrap();
        assert!(source.client().is_ok());

        let mut proxy = registry.proxy();
        proxy.enabled = true;
        proxy.host = "127.0.0.1".into();
        proxy.port = 7890;
        registry.set_proxy(proxy).unwrap();
        // Still constructible; the cached client was replaced.
        assert!(source.client().is_ok());
    }
}
