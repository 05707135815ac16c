//! The shared usage snapshot: name-keyed latest readouts behind one lock.

use crate::api::UsageResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// One account's latest readout.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub result: UsageResult,
    pub updated_at: DateTime<Utc>,
    // Sequence of the refresh that wrote this entry. When a targeted and a
    // full refresh race on the same account, the later-started one wins.
    seq: u64,
}

/// A detached copy of the mapping; the live map never leaves the store.
pub type Snapshot = HashMap<String, SnapshotEntry>;

#[derive(Default)]
pub struct SnapshotStore {
    entries: Mutex<Snapshot>,
    last_seq: AtomicU64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket for a refresh that is about to start. Writes carrying a ticket
    /// only ever replace entries written under an earlier one.
    pub fn begin_refresh(&self) -> u64 {
        self.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> Snapshot {
        self.entries.lock().clone()
    }

    /// Atomically replace the whole mapping with the results of a full
    /// refresh. `keep` lists the names still registered: results for
    /// since-deleted accounts are dropped, and an entry written by a
    /// later-sequenced targeted refresh survives the swap untouched.
    pub fn replace_all(
        &self,
        seq: u64,
        results: Vec<(String, UsageResult)>,
        keep: &[String],
    ) -> Snapshot {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let mut next: Snapshot = HashMap::with_capacity(results.len());
        for (name, result) in results {
            if !keep.contains(&name) {
                continue;
            }
            match entries.get(&name) {
                Some(existing) if existing.seq > seq => {
                    next.insert(name, existing.clone());
                }
                _ => {
                    next.insert(name, SnapshotEntry { result, updated_at: now, seq });
                }
            }
        }
        // Later-sequenced entries for accounts this refresh never saw (added
        // and targeted mid-flight) survive as well.
        for (name, existing) in entries.iter() {
            if existing.seq > seq && keep.contains(name) && !next.contains_key(name) {
                next.insert(name.clone(), existing.clone());
            }
        }
        *entries = next;
        entries.clone()
    }

    /// Upsert a single account's entry, leaving every other entry untouched.
    /// Returns false when a later-sequenced write already owns the slot.
    pub fn upsert(&self, seq: u64, name: &str, result: UsageResult) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(existing) if existing.seq > seq => false,
            _ => {
                entries.insert(
                    name.to_string(),
                    SnapshotEntry { result, updated_at: Utc::now(), seq },
                );
                true
            }
        }
    }

    /// Drop entries for accounts no longer registered.
    pub fn prune(&self, keep: &[String]) {
        self.entries.lock().retain(|name, _| keep.contains(name));
    }
}
