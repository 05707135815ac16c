//! Top-level wiring: storage, registry, API source, aggregator, scheduler.

use crate::account::Account;
use crate::aggregator::UsageAggregator;
use crate::registry::{AccountRegistry, RegistryError};
use crate::scheduler::{MonitorEvent, Scheduler};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::source::{CloudflareSource, UsageSource};
use crate::store::{ConfigStore, StoreError};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// The assembled engine. Presentation layers talk to the registry for
/// configuration and subscribe to events for usage updates.
pub struct Monitor {
    registry: Arc<AccountRegistry>,
    aggregator: Arc<UsageAggregator>,
    events: broadcast::Sender<MonitorEvent>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Monitor {
    /// Open against the default data directory (`~/.cfwatch`).
    pub fn open_default() -> Result<Self, StoreError> {
        let dir = ConfigStore::default_dir();
        Self::open(&dir.join("cfwatch.db"), &dir.join("cfwatch.json"))
    }

    pub fn open(db_path: &Path, mirror_path: &Path) -> Result<Self, StoreError> {
        let store = Arc::new(ConfigStore::open(db_path, mirror_path)?);
        let registry = Arc::new(AccountRegistry::load(store));
        let source = Arc::new(CloudflareSource::new(Arc::clone(&registry)));
        Ok(Self::assemble(registry, source))
    }

    /// Wire the engine around an arbitrary usage source.
    pub fn assemble(registry: Arc<AccountRegistry>, source: Arc<dyn UsageSource>) -> Self {
        let snapshot = Arc::new(SnapshotStore::new());
        let aggregator =
            Arc::new(UsageAggregator::new(Arc::clone(&registry), source, snapshot));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { registry, aggregator, events, scheduler: Mutex::new(None) }
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn aggregator(&self) -> &UsageAggregator {
        &self.aggregator
    }

    pub fn snapshot(&self) -> Snapshot {
        self.aggregator.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Start the background scheduler. A no-op when already running.
    pub fn start(&self) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_none() {
            *scheduler = Some(Scheduler::start(
                Arc::clone(&self.aggregator),
                Arc::clone(&self.registry),
                self.events.clone(),
            ));
        }
    }

    /// Stop the scheduler, waiting for its loop to exit.
    pub async fn stop(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }
    }

    /// Refresh one account ahead of schedule. A no-op when the scheduler is
    /// not running.
    pub fn request_refresh(&self, name: impl Into<String>) {
        if let Some(scheduler) = self.scheduler.lock().as_ref() {
            scheduler.request_single(name);
        }
    }

    /// Delete an account and drop its snapshot entry, so the snapshot never
    /// outlives the account set.
    pub fn delete_account(&self, index: usize) -> Result<Account, RegistryError> {
        let removed = self.registry.delete(index)?;
        self.aggregator.prune_snapshot();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Credentials, NewAccount};
    use crate::api::{UsageResult, UsageStats};
    use async_trait::async_trait;

    struct OkSource;

    #[async_trait]
    impl UsageSource for OkSource {
        async fn fetch(&self, _account: &Account) -> UsageResult {
            Ok(UsageStats {
                total_requests: 1,
                worker_requests: 1,
                page_requests: 0,
                account_id: "id".into(),
            })
        }
    }

    fn monitor() -> (tempfile::TempDir, Monitor) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("cfg.db"), &dir.path().join("cfg.json"))
            .unwrap();
        let registry = Arc::new(AccountRegistry::load(Arc::new(store)));
        for name in ["a", "b"] {
            registry
                .add(NewAccount {
                    name: name.into(),
                    credentials: Credentials::ApiToken { token: "tok".into() },
                    account_id: None,
                })
                .unwrap();
        }
        (dir, Monitor::assemble(registry, Arc::new(OkSource)))
    }

    #[tokio::test]
    async fn deleting_an_account_prunes_its_snapshot_entry() {
        let (_dir, monitor) = monitor();
        monitor.aggregator().refresh_all().await;
        assert_eq!(monitor.snapshot().len(), 2);

        let removed = monitor.delete_account(0).unwrap();
        assert_eq!(removed.name, "a");
        let snapshot = monitor.snapshot();
        assert!(!snapshot.contains_key("a"));
        assert!(snapshot.contains_key("b"));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let (_dir, monitor) = monitor();
        monitor.request_refresh("a");
        monitor.stop().await;
    }
}
