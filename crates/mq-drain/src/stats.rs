//! Transaction-consistent migration statistics.
//!
//! `increment` inside an active transaction accumulates in a tally that
//! only moves into the durable counter when the transaction commits, so
//! the dumped numbers never include work from a rolled-back attempt.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::message::Destination;
use crate::tx::{TxCoordinator, TxOutcome};

/// Final processed/discovered numbers for one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationStats {
    /// Messages transferred (committed only).
    pub processed: u64,
    /// Message count discovered at transfer start, if recorded.
    pub discovered: Option<u64>,
}

/// Per-destination counters, keyed by [`Destination::label`].
pub struct StatsTracker {
    coordinator: Arc<TxCoordinator>,
    sizes: Mutex<BTreeMap<String, u64>>,
    counters: Arc<Mutex<BTreeMap<String, u64>>>,
    /// Transaction-local tallies, one per destination per transaction.
    pending: Arc<Mutex<HashMap<String, Arc<AtomicU64>>>>,
}

impl StatsTracker {
    /// Create a tracker bound to the coordinator whose transactions gate
    /// counter visibility.
    pub fn new(coordinator: Arc<TxCoordinator>) -> Self {
        Self {
            coordinator,
            sizes: Mutex::new(BTreeMap::new()),
            counters: Arc::new(Mutex::new(BTreeMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record the message count discovered at transfer start.
    pub fn set_size(&self, destination: &Destination, size: u64) {
        self.sizes
            .lock()
            .expect("stats poisoned")
            .insert(destination.label(), size);
    }

    /// Count one transferred message.
    ///
    /// With a transaction active the increment lands in a tally whose
    /// post-commit hook moves it into the durable counter on `Committed`
    /// and discards it on `RolledBack`. Without a transaction the durable
    /// counter is incremented directly.
    pub fn increment(&self, destination: &Destination) {
        let label = destination.label();
        if !self.coordinator.is_active() {
            *self
                .counters
                .lock()
                .expect("stats poisoned")
                .entry(label)
                .or_insert(0) += 1;
            return;
        }

        let mut pending = self.pending.lock().expect("stats poisoned");
        let tally = match pending.get(&label) {
            Some(tally) => tally.clone(),
            None => {
                let tally = Arc::new(AtomicU64::new(0));
                pending.insert(label.clone(), tally.clone());

                let counters = Arc::clone(&self.counters);
                let pending_map = Arc::clone(&self.pending);
                let hook_tally = tally.clone();
                let hook_label = label.clone();
                // One hook per destination per transaction, mirroring one
                // synchronization object per destination.
                let registered = self.coordinator.register_post_commit(Box::new(
                    move |outcome| {
                        pending_map
                            .lock()
                            .expect("stats poisoned")
                            .remove(&hook_label);
                        let count = hook_tally.load(Ordering::SeqCst);
                        match outcome {
                            TxOutcome::Committed => {
                                *counters
                                    .lock()
                                    .expect("stats poisoned")
                                    .entry(hook_label)
                                    .or_insert(0) += count;
                            }
                            TxOutcome::RolledBack => {
                                if count > 0 {
                                    debug!(
                                        "discarding {} uncommitted increments for '{}'",
                                        count, hook_label
                                    );
                                }
                            }
                        }
                    },
                ));
                // The is_active check above makes this infallible; drop the
                // tally again if the transaction vanished underneath us.
                if registered.is_err() {
                    pending.remove(&label);
                    drop(pending);
                    *self
                        .counters
                        .lock()
                        .expect("stats poisoned")
                        .entry(destination.label())
                        .or_insert(0) += 1;
                    return;
                }
                tally
            }
        };
        tally.fetch_add(1, Ordering::SeqCst);
    }

    /// Committed transfer count for one destination.
    pub fn processed(&self, destination: &Destination) -> u64 {
        self.counters
            .lock()
            .expect("stats poisoned")
            .get(&destination.label())
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of every destination touched so far.
    pub fn snapshot(&self) -> BTreeMap<String, DestinationStats> {
        let sizes = self.sizes.lock().expect("stats poisoned");
        let counters = self.counters.lock().expect("stats poisoned");
        let mut snapshot: BTreeMap<String, DestinationStats> = BTreeMap::new();
        for (label, size) in sizes.iter() {
            snapshot.entry(label.clone()).or_default().discovered = Some(*size);
        }
        for (label, count) in counters.iter() {
            snapshot.entry(label.clone()).or_default().processed = *count;
        }
        snapshot
    }

    /// Log `processed / discovered` for every destination touched.
    pub fn dump(&self) {
        info!("Migration statistics ... ('destination' -> [processed / all])");
        for (label, stats) in self.snapshot() {
            let discovered = stats
                .discovered
                .map(|d| d.to_string())
                .unwrap_or_else(|| "?".into());
            info!(
                "Processing stats: '{}' -> [{} / {}]",
                label, stats.processed, discovered
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (StatsTracker, Arc<TxCoordinator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(TxCoordinator::new(dir.path()).unwrap());
        (StatsTracker::new(coordinator.clone()), coordinator, dir)
    }

    #[tokio::test]
    async fn test_increment_outside_transaction_is_direct() {
        let (stats, _tx, _dir) = tracker();
        let dest = Destination::queue("Q");
        stats.increment(&dest);
        stats.increment(&dest);
        assert_eq!(stats.processed(&dest), 2);
    }

    #[tokio::test]
    async fn test_increment_visible_only_after_commit() {
        let (stats, tx, _dir) = tracker();
        let dest = Destination::queue("Q");

        tx.begin().unwrap();
        stats.increment(&dest);
        stats.increment(&dest);
        assert_eq!(stats.processed(&dest), 0);

        tx.commit().await.unwrap();
        assert_eq!(stats.processed(&dest), 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_increments() {
        let (stats, tx, _dir) = tracker();
        let dest = Destination::queue("Q");

        tx.begin().unwrap();
        stats.increment(&dest);
        tx.rollback().await.unwrap();
        assert_eq!(stats.processed(&dest), 0);

        // A later successful attempt counts from scratch.
        tx.begin().unwrap();
        stats.increment(&dest);
        stats.increment(&dest);
        tx.commit().await.unwrap();
        assert_eq!(stats.processed(&dest), 2);
    }

    #[tokio::test]
    async fn test_snapshot_includes_sizes_without_counts() {
        let (stats, tx, _dir) = tracker();
        let dest = Destination::queue("Q");
        stats.set_size(&dest, 5);

        tx.begin().unwrap();
        stats.increment(&dest);
        tx.rollback().await.unwrap();

        let snapshot = stats.snapshot();
        let entry = snapshot.get("Q").unwrap();
        assert_eq!(entry.processed, 0);
        assert_eq!(entry.discovered, Some(5));
    }

    #[tokio::test]
    async fn test_separate_destinations_tracked_separately() {
        let (stats, tx, _dir) = tracker();
        let a = Destination::queue("A");
        let b = Destination::durable_subscription("c1", "T", "s1");

        tx.begin().unwrap();
        stats.increment(&a);
        stats.increment(&b);
        stats.increment(&b);
        tx.commit().await.unwrap();

        assert_eq!(stats.processed(&a), 1);
        assert_eq!(stats.processed(&b), 2);
        assert!(stats.snapshot().contains_key("T/s1"));
    }
}
