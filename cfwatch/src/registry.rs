//! Ordered account CRUD plus proxy/policy accessors, persisted through the
//! config store. Mutations are index-based against the in-memory list;
//! callers re-fetch after any mutation since indices may shift.

use crate::account::{Account, NewAccount, PersistedConfig, ProxyConfig, RefreshPolicy};
use crate::store::{ConfigStore, StoreError};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("account name must not be empty")]
    EmptyName,

    #[error("an account named {0:?} already exists")]
    DuplicateName(String),

    #[error("no account at index {0}")]
    BadIndex(usize),

    #[error("reorder must be a permutation of 0..{0}")]
    BadOrder(usize),

    #[error("unusable credentials: set email and global key, or an API token")]
    BadCredentials,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AccountRegistry {
    store: Arc<ConfigStore>,
    inner: RwLock<PersistedConfig>,
}

impl AccountRegistry {
    /// Load the persisted config into memory.
    pub fn load(store: Arc<ConfigStore>) -> Self {
        let config = store.load();
        Self { store, inner: RwLock::new(config) }
    }

    /// The current accounts, in display order.
    pub fn accounts(&self) -> Vec<Account> {
        self.inner.read().accounts.clone()
    }

    pub fn account_names(&self) -> Vec<String> {
        self.inner.read().accounts.iter().map(|a| a.name.clone()).collect()
    }

    pub fn find(&self, name: &str) -> Option<Account> {
        self.inner.read().accounts.iter().find(|a| a.name == name).cloned()
    }

    pub fn proxy(&self) -> ProxyConfig {
        self.inner.read().proxy.clone()
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.inner.read().policy.clone()
    }

    pub fn set_proxy(&self, proxy: ProxyConfig) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        inner.proxy = proxy;
        self.store.save(&inner)?;
        Ok(())
    }

    pub fn set_policy(&self, policy: RefreshPolicy) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        inner.policy = policy.clamped();
        self.store.save(&inner)?;
        Ok(())
    }

    fn validate(input: &NewAccount) -> Result<(), RegistryError> {
        if input.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if !input.credentials.is_usable() {
            return Err(RegistryError::BadCredentials);
        }
        Ok(())
    }

    /// Append a new account. The resolved-id cache starts empty.
    pub fn add(&self, input: NewAccount) -> Result<(), RegistryError> {
        Self::validate(&input)?;
        let mut inner = self.inner.write();
        if inner.accounts.iter().any(|a| a.name == input.name) {
            return Err(RegistryError::DuplicateName(input.name));
        }
        inner.accounts.push(Account {
            name: input.name,
            credentials: input.credentials,
            account_id: input.account_id.filter(|s| !s.is_empty()),
            cached_account_id: None,
            cache_updated_at: None,
        });
        self.store.save(&inner)?;
        Ok(())
    }

    /// Replace the account at `index`, carrying over the resolved-id cache
    /// from the entry being replaced. Renames do not invalidate the cache.
    pub fn update(&self, index: usize, input: NewAccount) -> Result<(), RegistryError> {
        Self::validate(&input)?;
        let mut inner = self.inner.write();
        if index >= inner.accounts.len() {
            return Err(RegistryError::BadIndex(index));
        }
        if inner.accounts.iter().enumerate().any(|(i, a)| i != index && a.name == input.name) {
            return Err(RegistryError::DuplicateName(input.name));
        }
        let cached_account_id = inner.accounts[index].cached_account_id.take();
        let cache_updated_at = inner.accounts[index].cache_updated_at;
        inner.accounts[index] = Account {
            name: input.name,
            credentials: input.credentials,
            account_id: input.account_id.filter(|s| !s.is_empty()),
            cached_account_id,
            cache_updated_at,
        };
        self.store.save(&inner)?;
        Ok(())
    }

    /// Remove and return the account at `index`.
    pub fn delete(&self, index: usize) -> Result<Account, RegistryError> {
        let mut inner = self.inner.write();
        if index >= inner.accounts.len() {
            return Err(RegistryError::BadIndex(index));
        }
        let removed = inner.accounts.remove(index);
        self.store.save(&inner)?;
        Ok(removed)
    }

    /// Persist a new ordering: `order[i]` is the old index that moves to
    /// position `i`. Must be a permutation of the current indices.
    pub fn reorder(&self, order: &[usize]) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let len = inner.accounts.len();
        if order.len() != len {
            return Err(RegistryError::BadOrder(len));
        }
        let mut seen = vec![false; len];
        for &i in order {
            if i >= len || seen[i] {
                return Err(RegistryError::BadOrder(len));
            }
            seen[i] = true;
        }
        let mut slots: Vec<Option<Account>> =
            std::mem::take(&mut inner.accounts).into_iter().map(Some).collect();
        let mut next = Vec::with_capacity(len);
        for &i in order {
            if let Some(account) = slots[i].take() {
                next.push(account);
            }
        }
        inner.accounts = next;
        self.store.save(&inner)?;
        Ok(())
    }

    /// Record a freshly resolved account id. A silent no-op when the account
    /// was deleted in the meantime. The in-memory entry updates immediately;
    /// persistence happens on a detached best-effort thread so query workers
    /// never block on storage, with a synchronous fallback when the thread
    /// cannot be spawned.
    pub fn record_resolved_id(&self, name: &str, account_id: &str) {
        let snapshot = {
            let mut inner = self.inner.write();
            let Some(account) = inner.accounts.iter_mut().find(|a| a.name == name) else {
                return;
            };
            account.cached_account_id = Some(account_id.to_string());
            account.cache_updated_at = Some(Utc::now());
            inner.clone()
        };

        let store = Arc::clone(&self.store);
        let detached = snapshot.clone();
        let spawned = std::thread::Builder::new()
            .name("cfwatch-cache-save".into())
            .spawn(move || {
                if let Err(e) = store.save(&detached) {
                    tracing::warn!("resolved-id cache save failed: {e}");
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("cache writer thread unavailable ({e}), saving inline");
            if let Err(e) = self.store.save(&snapshot) {
                tracing::warn!("resolved-id cache save failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Credentials;

    fn registry() -> (tempfile::TempDir, AccountRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("cfg.db"), &dir.path().join("cfg.json"))
            .unwrap();
        (dir, AccountRegistry::load(Arc::new(store)))
    }

    fn token_account(name: &str) -> NewAccount {
        NewAccount {
            name: name.into(),
            credentials: Credentials::ApiToken { token: "tok".into() },
            account_id: None,
        }
    }

    #[test]
    fn add_rejects_empty_name_and_duplicates() {
        let (_dir, registry) = registry();
        assert!(matches!(registry.add(token_account("  ")), Err(RegistryError::EmptyName)));
        registry.add(token_account("acme")).unwrap();
        assert!(matches!(
            registry.add(token_account("acme")),
            Err(RegistryError::DuplicateName(_))
        ));
    }

    #[test]
    fn add_rejects_unusable_credentials() {
        let (_dir, registry) = registry();
        let input = NewAccount {
            name: "acme".into(),
            credentials: Credentials::GlobalKey { email: "a@b".into(), key: String::new() },
            account_id: None,
        };
        assert!(matches!(registry.add(input), Err(RegistryError::BadCredentials)));
    }

    #[test]
    fn add_starts_with_an_empty_cache() {
        let (_dir, registry) = registry();
        registry.add(token_account("acme")).unwrap();
        let account = &registry.accounts()[0];
        assert_eq!(account.cached_account_id, None);
        assert_eq!(account.cache_updated_at, None);
    }

    #[test]
    fn update_preserves_the_resolved_id_cache() {
        let (_dir, registry) = registry();
        registry.add(token_account("acme")).unwrap();
        registry.record_resolved_id("acme", "abc123");

        // Rename and swap credential mode; the cache must survive.
        let input = NewAccount {
            name: "acme-renamed".into(),
            credentials: Credentials::GlobalKey { email: "a@b".into(), key: "k".into() },
            account_id: None,
        };
        registry.update(0, input).unwrap();
        let account = &registry.accounts()[0];
        assert_eq!(account.name, "acme-renamed");
        assert_eq!(account.cached_account_id.as_deref(), Some("abc123"));
        assert!(account.cache_updated_at.is_some());
    }

    #[test]
    fn delete_removes_the_entry() {
        let (_dir, registry) = registry();
        registry.add(token_account("a")).unwrap();
        registry.add(token_account("b")).unwrap();
        let removed = registry.delete(0).unwrap();
        assert_eq!(removed.name, "a");
        assert_eq!(registry.account_names(), vec!["b".to_string()]);
        assert!(matches!(registry.delete(5), Err(RegistryError::BadIndex(5))));
    }

    #[test]
    fn reorder_permutes_and_persists() {
        let (dir, registry) = registry();
        registry.add(token_account("a")).unwrap();
        registry.add(token_account("b")).unwrap();
        registry.add(token_account("c")).unwrap();
        registry.reorder(&[2, 0, 1]).unwrap();
        assert_eq!(registry.account_names(), vec!["c", "a", "b"]);

        // A fresh load sees the persisted order.
        let store = ConfigStore::open(&dir.path().join("cfg.db"), &dir.path().join("cfg.json"))
            .unwrap();
        let reloaded = AccountRegistry::load(Arc::new(store));
        assert_eq!(reloaded.account_names(), vec!["c", "a", "b"]);
    }

    #[test]
    fn reorder_rejects_non_permutations() {
        let (_dir, registry) = registry();
        registry.add(token_account("a")).unwrap();
        registry.add(token_account("b")).unwrap();
        assert!(matches!(registry.reorder(&[0]), Err(RegistryError::BadOrder(2))));
        assert!(matches!(registry.reorder(&[0, 0]), Err(RegistryError::BadOrder(2))));
        assert!(matches!(registry.reorder(&[0, 2]), Err(RegistryError::BadOrder(2))));
    }

    #[test]
    fn cache_write_for_a_deleted_account_is_dropped() {
        let (_dir, registry) = registry();
        registry.add(token_account("a")).unwrap();
        registry.record_resolved_id("ghost", "abc");
        assert_eq!(registry.accounts()[0].cached_account_id, None);
    }

    #[test]
    fn explicit_account_id_is_kept_and_empty_is_dropped() {
        let (_dir, registry) = registry();
        let mut input = token_account("a");
        input.account_id = Some(String::new());
        registry.add(input).unwrap();
        assert_eq!(registry.accounts()[0].account_id, None);

        let mut input = token_account("b");
        input.account_id = Some("explicit".into());
        registry.add(input).unwrap();
        assert_eq!(registry.accounts()[1].account_id.as_deref(), Some("explicit"));
    }
}
