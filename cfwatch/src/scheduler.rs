//! Background refresh loop: periodic full refreshes, single-account
//! preemption, and cooperative shutdown.

use crate::aggregator::UsageAggregator;
use crate::api::UsageResult;
use crate::registry::AccountRegistry;
use crate::snapshot::Snapshot;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Engine events consumed by presentation layers.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A periodic refresh finished; the whole snapshot was replaced.
    FullUpdate(Snapshot),
    /// A targeted refresh finished for one account.
    AccountUpdate { name: String, result: UsageResult },
    /// A refresh pass failed outright; the loop keeps running.
    Error(String),
}

struct Shared {
    // Pending single-account request. Overwritten by a newer request before
    // the first is serviced.
    pending: Mutex<Option<String>>,
    wake: Notify,
}

/// Owns the refresh loop task. Stop and preemption requests take effect at
/// the loop's suspension points; in-flight network calls are never
/// interrupted.
pub struct Scheduler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<MonitorEvent>,
}

impl Scheduler {
    /// Spawn the refresh loop on the current runtime. The first full refresh
    /// starts immediately.
    pub fn start(
        aggregator: Arc<UsageAggregator>,
        registry: Arc<AccountRegistry>,
        events: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        let shared = Arc::new(Shared { pending: Mutex::new(None), wake: Notify::new() });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            aggregator,
            registry,
            Arc::clone(&shared),
            shutdown_rx,
            events.clone(),
        ));
        Self { shared, shutdown: shutdown_tx, task: Mutex::new(Some(task)), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Ask the loop to refresh one account ahead of the periodic schedule.
    /// A second request before the first is serviced replaces it.
    pub fn request_single(&self, name: impl Into<String>) {
        *self.shared.pending.lock() = Some(name.into());
        self.shared.wake.notify_one();
    }

    /// Request shutdown and wait for the loop task to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.shared.wake.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn run_loop(
    aggregator: Arc<UsageAggregator>,
    registry: Arc<AccountRegistry>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    events: broadcast::Sender<MonitorEvent>,
) {
    tracing::debug!("refresh loop started");
    while !*shutdown.borrow() {
        let pending = shared.pending.lock().take();
        match pending {
            Some(name) => match aggregator.refresh_one(&name).await {
                Some(result) => {
                    let _ = events.send(MonitorEvent::AccountUpdate { name, result });
                }
                None => {
                    let _ = events
                        .send(MonitorEvent::Error(format!("refresh failed: unknown account {name:?}")));
                }
            },
            None => {
                let snapshot = aggregator.refresh_all().await;
                let _ = events.send(MonitorEvent::FullUpdate(snapshot));
            }
        }

        idle_wait(&registry, &shared, &mut shutdown).await;
    }
    tracing::debug!("refresh loop stopped");
}

/// Sleep until the next periodic refresh is due, waking early when a stop or
/// a single-account request arrives.
async fn idle_wait(
    registry: &AccountRegistry,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) {
    let deadline = Instant::now() + registry.policy().interval();
    loop {
        if *shutdown.borrow() || shared.pending.lock().is_some() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return,
            _ = shared.wake.notified() => {}
            _ = shutdown.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, Credentials, NewAccount, RefreshPolicy};
    use crate::api::UsageStats;
    use crate::snapshot::SnapshotStore;
    use crate::source::UsageSource;
    use crate::store::ConfigStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    struct OkSource;

    #[async_trait]
    impl UsageSource for OkSource {
        async fn fetch(&self, account: &Account) -> UsageResult {
            Ok(UsageStats {
                total_requests: 7,
                worker_requests: 7,
                page_requests: 0,
                account_id: format!("id-{}", account.name),
            })
        }
    }

    fn engine(names: &[&str]) -> (tempfile::TempDir, Arc<UsageAggregator>, Arc<AccountRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(&dir.path().join("cfg.db"), &dir.path().join("cfg.json"))
            .unwrap();
        let registry = Arc::new(AccountRegistry::load(Arc::new(store)));
        for name in names {
            registry
                .add(NewAccount {
                    name: (*name).into(),
                    credentials: Credentials::ApiToken { token: "tok".into() },
                    account_id: None,
                })
                .unwrap();
        }
        // A long interval so tests exercise preemption, not the cadence.
        registry
            .set_policy(RefreshPolicy { interval_secs: 3600, daily_request_limit: 1 })
            .unwrap();
        let aggregator = Arc::new(UsageAggregator::new(
            Arc::clone(&registry),
            Arc::new(OkSource),
            Arc::new(SnapshotStore::new()),
        ));
        (dir, aggregator, registry)
    }

    async fn next_event(rx: &mut broadcast::Receiver<MonitorEvent>) -> MonitorEvent {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn first_pass_is_a_full_refresh() {
        let (_dir, aggregator, registry) = engine(&["a", "b"]);
        let (events, mut rx) = broadcast::channel(16);
        let scheduler = Scheduler::start(aggregator, registry, events);

        match next_event(&mut rx).await {
            MonitorEvent::FullUpdate(snapshot) => assert_eq!(snapshot.len(), 2),
            other => panic!("expected a full update, got {other:?}"),
        }
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn preemption_is_serviced_without_waiting_out_the_interval() {
        let (_dir, aggregator, registry) = engine(&["a", "b"]);
        let (events, mut rx) = broadcast::channel(16);
        let scheduler = Scheduler::start(aggregator, registry, events);

        // Let the initial full refresh pass, then preempt during the wait.
        assert!(matches!(next_event(&mut rx).await, MonitorEvent::FullUpdate(_)));
        scheduler.request_single("b");

        match next_event(&mut rx).await {
            MonitorEvent::AccountUpdate { name, result } => {
                assert_eq!(name, "b");
                assert_eq!(result.unwrap().total_requests, 7);
            }
            other => panic!("expected a single-account update, got {other:?}"),
        }
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn unknown_preemption_target_reports_an_error() {
        let (_dir, aggregator, registry) = engine(&["a"]);
        let (events, mut rx) = broadcast::channel(16);
        let scheduler = Scheduler::start(aggregator, registry, events);

        assert!(matches!(next_event(&mut rx).await, MonitorEvent::FullUpdate(_)));
        scheduler.request_single("ghost");

        match next_event(&mut rx).await {
            MonitorEvent::Error(message) => assert!(message.contains("ghost")),
            other => panic!("expected an error event, got {other:?}"),
        }
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn a_newer_request_overwrites_the_pending_one() {
        let (_dir, aggregator, registry) = engine(&["a", "b"]);
        let (events, mut rx) = broadcast::channel(16);
        let scheduler = Scheduler::start(aggregator, registry, events);

        assert!(matches!(next_event(&mut rx).await, MonitorEvent::FullUpdate(_)));
        // Both land before the wait breaks; only the latest is serviced.
        scheduler.request_single("a");
        scheduler.request_single("b");

        match next_event(&mut rx).await {
            MonitorEvent::AccountUpdate { name, .. } => assert_eq!(name, "b"),
            other => panic!("expected a single-account update, got {other:?}"),
        }
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_joins_the_loop() {
        let (_dir, aggregator, registry) = engine(&["a"]);
        let (events, _rx) = broadcast::channel(16);
        let scheduler = Scheduler::start(aggregator, registry, events);
        timeout(Duration::from_secs(5), scheduler.stop()).await.unwrap();
        // A second stop is a no-op.
        scheduler.stop().await;
    }
}
