//! Periodic lookup of clusters due for reconciliation.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mothership_inventory::{Inventory, SharedInventory, State};

use crate::error::SchedulerError;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryWatchConfig {
    pub watch_interval: Duration,
    /// Minimum age of a concluded run before the cluster is reconciled again.
    pub reconcile_interval: Duration,
}

impl Default for InventoryWatchConfig {
    fn default() -> Self {
        Self {
            watch_interval: DEFAULT_WATCH_INTERVAL,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }
}

impl InventoryWatchConfig {
    /// Zero intervals fall back to the defaults.
    fn normalized(mut self) -> Self {
        if self.watch_interval.is_zero() {
            self.watch_interval = DEFAULT_WATCH_INTERVAL;
        }
        if self.reconcile_interval.is_zero() {
            self.reconcile_interval = DEFAULT_RECONCILE_INTERVAL;
        }
        self
    }
}

#[derive(Clone)]
pub struct InventoryWatcher {
    inventory: SharedInventory,
    config: InventoryWatchConfig,
}

enum Feed {
    Continue,
    Stop,
}

impl InventoryWatcher {
    pub fn new(inventory: SharedInventory, config: InventoryWatchConfig) -> Self {
        Self {
            inventory,
            config: config.normalized(),
        }
    }

    pub fn inventory(&self) -> SharedInventory {
        self.inventory.clone()
    }

    pub fn config(&self) -> &InventoryWatchConfig {
        &self.config
    }

    /// Feeds due clusters into `queue` right away and then on every watch interval, until
    /// `cancel` fires or the receiver is gone. Blocks while the queue is full.
    pub async fn run(
        &self,
        queue: mpsc::Sender<State>,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        log::info!(
            "inventory_watch_started watch_interval_secs={} reconcile_interval_secs={}",
            self.config.watch_interval.as_secs(),
            self.config.reconcile_interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.config.watch_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("inventory_watch_stopped reason=cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            if let Feed::Stop = self.process(&queue, &cancel).await {
                return Ok(());
            }
        }
    }

    async fn process(&self, queue: &mpsc::Sender<State>, cancel: &CancellationToken) -> Feed {
        let states = match self
            .inventory
            .clusters_to_reconcile(self.config.reconcile_interval)
        {
            Ok(states) => states,
            Err(e) => {
                log::error!(
                    "inventory_watch_query_failed reconcile_interval_secs={} error={}",
                    self.config.reconcile_interval.as_secs(),
                    e
                );
                return Feed::Continue;
            }
        };
        log::debug!("inventory_watch_found clusters={}", states.len());

        for state in states {
            let runtime_id = state.runtime_id().to_string();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Feed::Stop,
                sent = queue.send(state) => {
                    if sent.is_err() {
                        log::debug!("inventory_watch_stopped reason=queue_closed");
                        return Feed::Stop;
                    }
                    log::debug!("inventory_watch_enqueued runtime_id={}", runtime_id);
                }
            }
        }
        Feed::Continue
    }
}

#[cfg(all(test, feature = "sqlite-persistence"))]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transition::tests::{cluster_spec, temp_db_path};
    use mothership_inventory::{Connection, DefaultInventory, SqliteConnection};

    fn inventory() -> SharedInventory {
        let conn: Arc<dyn Connection + Send + Sync> =
            Arc::new(SqliteConnection::open(temp_db_path()).expect("open sqlite"));
        Arc::new(DefaultInventory::new(conn).expect("inventory"))
    }

    #[test]
    fn zero_intervals_use_defaults() {
        let watcher = InventoryWatcher::new(
            inventory(),
            InventoryWatchConfig {
                watch_interval: Duration::ZERO,
                reconcile_interval: Duration::ZERO,
            },
        );
        assert_eq!(watcher.config(), &InventoryWatchConfig::default());
    }

    #[tokio::test]
    async fn pending_clusters_are_queued_with_backpressure() {
        let inventory = inventory();
        for id in ["rt-1", "rt-2", "rt-3"] {
            inventory
                .create_or_update(1, &cluster_spec(id, &["istio"]))
                .expect("create");
        }
        let watcher = InventoryWatcher::new(inventory, InventoryWatchConfig::default());
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { watcher.run(tx, cancel).await }
        });

        let mut seen = Vec::new();
        for _ in 0..3 {
            let state = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("queued in time")
                .expect("queue open");
            seen.push(state.runtime_id().to_string());
        }
        seen.sort();
        assert_eq!(seen, ["rt-1", "rt-2", "rt-3"]);

        cancel.cancel();
        task.await.expect("join").expect("watch result");
    }

    #[tokio::test]
    async fn closed_queue_stops_the_watch() {
        let inventory = inventory();
        inventory
            .create_or_update(1, &cluster_spec("rt-1", &["istio"]))
            .expect("create");
        let watcher = InventoryWatcher::new(inventory, InventoryWatchConfig::default());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        watcher
            .run(tx, CancellationToken::new())
            .await
            .expect("stops without error");
    }
}
