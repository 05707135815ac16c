//! Fan-out/fan-in refresh over the registered accounts.

use crate::api::UsageResult;
use crate::registry::AccountRegistry;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::source::UsageSource;
use futures::StreamExt;
use std::sync::Arc;

/// Upper bound on in-flight usage queries during a full refresh.
pub const DEFAULT_MAX_WORKERS: usize = 5;

pub struct UsageAggregator {
    registry: Arc<AccountRegistry>,
    source: Arc<dyn UsageSource>,
    snapshot: Arc<SnapshotStore>,
    max_workers: usize,
}

impl UsageAggregator {
    pub fn new(
        registry: Arc<AccountRegistry>,
        source: Arc<dyn UsageSource>,
        snapshot: Arc<SnapshotStore>,
    ) -> Self {
        Self { registry, source, snapshot, max_workers: DEFAULT_MAX_WORKERS }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// A detached copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.snapshot()
    }

    /// Query every registered account with bounded parallelism, then swap
    /// the collected results in as one atomic replacement. Per-account
    /// failures are data; they never abort sibling queries.
    pub async fn refresh_all(&self) -> Snapshot {
        let accounts = self.registry.accounts();
        let seq = self.snapshot.begin_refresh();
        tracing::debug!(accounts = accounts.len(), "starting full refresh");

        let results: Vec<(String, UsageResult)> = futures::stream::iter(accounts)
            .map(|account| {
                let source = Arc::clone(&self.source);
                async move {
                    let result = source.fetch(&account).await;
                    (account.name, result)
                }
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        // Reconcile against the registry as it is *now*: accounts deleted
        // while the refresh was in flight stay out of the snapshot.
        let keep = self.registry.account_names();
        self.snapshot.replace_all(seq, results, &keep)
    }

    /// Query one account outside the periodic path and upsert its entry,
    /// leaving all other entries untouched. `None` when the account is no
    /// longer registered.
    pub async fn refresh_one(&self, name: &str) -> Option<UsageResult> {
        let account = self.registry.find(name)?;
        let seq = self.snapshot.begin_refresh();
        let result = self.source.fetch(&account).await;
        if !self.snapshot.upsert(seq, name, result.clone()) {
            tracing::debug!(account = name, "targeted refresh superseded by a newer write");
        }
        Some(result)
    }

    /// Drop snapshot entries for accounts no longer registered.
    pub fn prune_snapshot(&self) {
        self.snapshot.prune(&self.registry.account_names());
    }
}
