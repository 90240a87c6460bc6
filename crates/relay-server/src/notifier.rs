//! Change notifier — long-poll over the mapping table.
//!
//! Each cluster has a `watch` channel holding the highest revision this
//! process knows about. Local mutations publish their new revision directly;
//! changes committed by other replicas sharing the store are picked up by
//! [`ChangeNotifier::refresh`]. A watch channel wakes every receiver at once,
//! so all pollers of a cluster are released by a single mutation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use relay_core::{ClusterId, ClusterState};
use relay_state::{MappingTable, StateResult};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{CancelReason, RelayError, RelayResult};

/// Shortest period for background loops; tokio rejects a zero interval.
pub(crate) const MIN_TICK: Duration = Duration::from_millis(1);

pub struct ChangeNotifier {
    channels: Mutex<HashMap<ClusterId, watch::Sender<u64>>>,
    shutdown: watch::Sender<bool>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            channels: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn subscribe(&self, cluster_id: &str) -> watch::Receiver<u64> {
        let mut channels = self.channels.lock().expect("channels lock");
        channels
            .entry(cluster_id.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Record that `cluster_id` reached `revision`, waking its waiters.
    ///
    /// Revisions only move forward; publishing an older one is a no-op.
    pub fn publish(&self, cluster_id: &str, revision: u64) -> bool {
        let mut channels = self.channels.lock().expect("channels lock");
        let tx = channels
            .entry(cluster_id.to_string())
            .or_insert_with(|| watch::channel(0).0);
        let advanced = tx.send_if_modified(|current| {
            if revision > *current {
                *current = revision;
                true
            } else {
                false
            }
        });
        if advanced {
            debug!(%cluster_id, revision, waiters = tx.receiver_count(), "revision published");
        }
        advanced
    }

    /// Release every waiter with a shutdown cancellation. Later waits fail
    /// immediately.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!("change notifier shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Return the cluster's state once its revision differs from `requested`.
    ///
    /// If `requested` is not the live revision the current state comes back
    /// at once. Otherwise this waits for the next mutation, failing with
    /// [`CancelReason::Timeout`] after `timeout` or [`CancelReason::Shutdown`]
    /// when the server stops. Dropping the future abandons the wait.
    pub async fn wait_for_change(
        &self,
        table: &MappingTable,
        cluster_id: &str,
        requested: i64,
        timeout: Duration,
    ) -> RelayResult<ClusterState> {
        // Subscribe before reading so a mutation landing in between is seen.
        let mut changes = self.subscribe(cluster_id);
        let mut shutdown = self.shutdown.subscribe();

        let state = table.get_port_mappings(cluster_id)?;
        if requested != state.revision as i64 {
            return Ok(state);
        }
        let current = state.revision;
        // The store may be ahead of this process's channel.
        self.publish(cluster_id, current);

        debug!(%cluster_id, revision = current, ?timeout, "waiting for change");
        let outcome = tokio::select! {
            changed = changes.wait_for(|r| *r > current) => {
                changed.map(|_| ()).map_err(|_| CancelReason::Shutdown)
            }
            _ = tokio::time::sleep(timeout) => Err(CancelReason::Timeout),
            _ = shutdown.wait_for(|stopped| *stopped) => Err(CancelReason::Shutdown),
        };

        match outcome {
            Ok(()) => Ok(table.get_port_mappings(cluster_id)?),
            Err(reason) => {
                debug!(%cluster_id, revision = current, %reason, "long poll cancelled");
                Err(RelayError::Cancelled(reason))
            }
        }
    }

    /// Publish the store's current revision of every cluster. Returns how
    /// many clusters advanced.
    ///
    /// Channels for clusters the store has never seen are dropped once
    /// nobody waits on them.
    pub fn refresh(&self, table: &MappingTable) -> StateResult<usize> {
        let clusters: HashSet<ClusterId> = table.get_clusters()?.into_iter().collect();
        let mut advanced = 0;
        for cluster_id in &clusters {
            let state = table.get_port_mappings(cluster_id)?;
            if self.publish(cluster_id, state.revision) {
                advanced += 1;
            }
        }

        let mut channels = self.channels.lock().expect("channels lock");
        let before = channels.len();
        channels.retain(|id, tx| clusters.contains(id) || tx.receiver_count() > 0);
        if channels.len() < before {
            debug!(pruned = before - channels.len(), "dropped idle unknown-cluster channels");
        }
        Ok(advanced)
    }

    /// Number of clusters with a live change channel.
    pub fn tracked_clusters(&self) -> usize {
        self.channels.lock().expect("channels lock").len()
    }

    /// Periodically pick up changes written by other replicas.
    pub async fn run(
        &self,
        table: &MappingTable,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval.max(MIN_TICK));
        info!(?interval, "store refresh loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh(table) {
                        Ok(advanced) if advanced > 0 => {
                            debug!(advanced, "picked up external mapping changes");
                        }
                        Err(e) => warn!(error = %e, "store refresh failed"),
                        _ => {}
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("store refresh loop stopped");
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::PortPoolConfig;
    use relay_core::{Port, Protocol};
    use relay_state::MemoryMappingStore;
    use std::sync::Arc;

    fn table() -> MappingTable {
        MappingTable::new(
            Arc::new(MemoryMappingStore::new()),
            PortPoolConfig {
                min_port: 1000,
                max_port: 1100,
            },
        )
    }

    fn add(table: &MappingTable, lease: &str) -> u64 {
        table
            .add_port_mapping("c1", lease, None, "10.0.0.1", &[Port::new(Protocol::Tcp, 22)], 0)
            .unwrap()
            .revision
    }

    #[test]
    fn publish_only_moves_forward() {
        let notifier = ChangeNotifier::new();
        assert!(notifier.publish("c1", 3));
        assert!(!notifier.publish("c1", 3));
        assert!(!notifier.publish("c1", 2));
        assert!(notifier.publish("c1", 4));
    }

    #[tokio::test]
    async fn mismatched_revision_returns_immediately() {
        let table = table();
        add(&table, "lease1");
        let notifier = ChangeNotifier::new();

        for requested in [-1, 0, 7] {
            let state = notifier
                .wait_for_change(&table, "c1", requested, Duration::from_secs(3600))
                .await
                .unwrap();
            assert_eq!(state.revision, 1);
            assert_eq!(state.mappings.len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn caught_up_poll_times_out() {
        let table = table();
        add(&table, "lease1");
        let notifier = ChangeNotifier::new();

        let err = notifier
            .wait_for_change(&table, "c1", 1, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Cancelled(CancelReason::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_cluster_waits_at_revision_zero() {
        let table = table();
        let notifier = ChangeNotifier::new();

        let err = notifier
            .wait_for_change(&table, "empty", 0, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Cancelled(CancelReason::Timeout)));
    }

    #[tokio::test]
    async fn mutation_releases_waiter() {
        let table = table();
        add(&table, "lease1");
        let notifier = Arc::new(ChangeNotifier::new());

        let waiter = {
            let table = table.clone();
            let notifier = notifier.clone();
            tokio::spawn(async move {
                notifier
                    .wait_for_change(&table, "c1", 1, Duration::from_secs(60))
                    .await
            })
        };
        tokio::task::yield_now().await;

        let revision = add(&table, "lease2");
        notifier.publish("c1", revision);

        let state = waiter.await.unwrap().unwrap();
        assert_eq!(state.revision, 2);
        assert!(state.mappings.contains_key("lease2"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let table = table();
        let notifier = Arc::new(ChangeNotifier::new());

        let waiter = {
            let table = table.clone();
            let notifier = notifier.clone();
            tokio::spawn(async move {
                notifier
                    .wait_for_change(&table, "c1", 0, Duration::from_secs(3600))
                    .await
            })
        };
        tokio::task::yield_now().await;
        notifier.shutdown();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Cancelled(CancelReason::Shutdown)));
        assert!(notifier.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_prunes_idle_unknown_clusters() {
        let table = table();
        add(&table, "lease1");
        let notifier = ChangeNotifier::new();

        for ghost in ["ghost-a", "ghost-b"] {
            let err = notifier
                .wait_for_change(&table, ghost, 0, Duration::from_millis(10))
                .await
                .unwrap_err();
            assert!(err.is_cancelled());
        }
        assert_eq!(notifier.tracked_clusters(), 2);

        notifier.refresh(&table).unwrap();
        assert_eq!(notifier.tracked_clusters(), 1);
        assert!(!notifier.publish("c1", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_tolerates_zero_interval() {
        let table = table();
        add(&table, "lease1");
        let notifier = Arc::new(ChangeNotifier::new());
        let (tx, rx) = watch::channel(false);

        let handle = {
            let notifier = notifier.clone();
            let table = table.clone();
            tokio::spawn(async move { notifier.run(&table, Duration::ZERO, rx).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!notifier.publish("c1", 1));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn refresh_publishes_store_revisions() {
        let table = table();
        add(&table, "lease1");
        add(&table, "lease2");
        let notifier = ChangeNotifier::new();

        assert_eq!(notifier.refresh(&table).unwrap(), 1);
        assert_eq!(notifier.refresh(&table).unwrap(), 0);
        assert!(!notifier.publish("c1", 2));
    }
}
