mod destination_stats;
mod store;

pub use destination_stats::DestinationStats;
pub use store::LedgerStore;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Point-in-time copy of the ledger, ordered by destination.
pub type LedgerSnapshot = BTreeMap<String, DestinationStats>;

/// Per-destination traffic counters shared by every proxy session.
///
/// A single lock guards the whole table: mutations are a few additions and
/// the number of distinct destinations is small. Snapshots are taken under
/// the same lock, so a persisted table never contains a torn entry.
pub struct BandwidthLedger {
    destinations: Mutex<LedgerSnapshot>,
    store: LedgerStore,
    // Held from snapshot to rename: saves never interleave on the temp file
    // and an older table never lands after a newer one.
    flush_lock: tokio::sync::Mutex<()>,
}

impl BandwidthLedger {
    pub fn new(store: LedgerStore) -> Self {
        Self::with_snapshot(store, LedgerSnapshot::new())
    }

    pub fn with_snapshot(store: LedgerStore, snapshot: LedgerSnapshot) -> Self {
        Self {
            destinations: Mutex::new(snapshot),
            store,
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Restores the ledger from its store, starting empty when the file is
    /// missing or unreadable.
    pub async fn load(store: LedgerStore) -> Self {
        match store.load().await {
            Ok(snapshot) => {
                info!(
                    "Loaded bandwidth ledger from {} ({} destinations)",
                    store.path().display(),
                    snapshot.len()
                );
                Self::with_snapshot(store, snapshot)
            }
            Err(e) => {
                warn!(
                    "Could not load bandwidth ledger from {}, starting empty: {}",
                    store.path().display(),
                    e
                );
                Self::new(store)
            }
        }
    }

    pub fn record_request(&self, destination: &str) {
        self.update(destination, DestinationStats::add_request);
    }

    pub fn record_bytes(&self, destination: &str, sent: u64, received: u64) {
        if sent == 0 && received == 0 {
            return;
        }
        self.update(destination, |stats| stats.add_bytes(sent, received));
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.destinations.lock().clone()
    }

    pub fn stats(&self, destination: &str) -> Option<DestinationStats> {
        self.destinations.lock().get(destination).copied()
    }

    /// Writes the current table to the store. Failures are logged and
    /// swallowed; the in-memory counters are unaffected either way.
    pub async fn flush(&self) -> bool {
        let _guard = self.flush_lock.lock().await;
        let snapshot = self.snapshot();
        match self.store.save(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Failed to persist bandwidth ledger to {}: {}",
                    self.store.path().display(),
                    e
                );
                false
            }
        }
    }

    /// Fire-and-forget flush for callers that cannot await, such as drop
    /// handlers. Does nothing outside a Tokio runtime.
    pub fn schedule_flush(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ledger = Arc::clone(self);
                handle.spawn(async move {
                    ledger.flush().await;
                });
            }
            Err(_) => debug!("No runtime available, skipping scheduled ledger flush"),
        }
    }

    fn update<F>(&self, destination: &str, apply: F)
    where
        F: FnOnce(&mut DestinationStats),
    {
        let mut destinations = self.destinations.lock();
        match destinations.get_mut(destination) {
            Some(stats) => apply(stats),
            None => {
                let mut stats = DestinationStats::default();
                apply(&mut stats);
                destinations.insert(destination.to_string(), stats);
            }
        }
    }
}
