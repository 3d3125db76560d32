//! Scheduler for the mothership: watches the inventory and reconciles due clusters through a
//! bounded pool of slots, one cluster per slot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use mothership_inventory::{ClusterStatus, State};

use crate::error::SchedulerError;
use crate::handler::ReconciliationHandler;
use crate::inventory_watch::InventoryWatcher;
use crate::operations::OperationsRegistry;
use crate::reconciliation::ReconciliationRepository;
use crate::status_updater::{ClusterStatusUpdater, TransitionSink, DEFAULT_PROGRESS_TIMEOUT};
use crate::transition::{ClusterStatusTransition, RunOutcome};

pub const DEFAULT_POOL_SIZE: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSchedulerConfig {
    /// Clusters reconciled at the same time. Also the capacity of the watcher queue.
    pub pool_size: usize,
    /// Bound of the status aggregation of one run.
    pub progress_timeout: Duration,
}

impl Default for RemoteSchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            progress_timeout: DEFAULT_PROGRESS_TIMEOUT,
        }
    }
}

/// Everything one pool slot needs to reconcile a cluster.
#[derive(Clone)]
struct Slot {
    transition: Arc<ClusterStatusTransition>,
    handler: Arc<ReconciliationHandler>,
    registry: Arc<dyn OperationsRegistry>,
    progress_timeout: Duration,
}

pub struct RemoteScheduler {
    watcher: InventoryWatcher,
    slot: Slot,
    pool_size: usize,
}

impl RemoteScheduler {
    pub fn new(
        watcher: InventoryWatcher,
        transition: Arc<ClusterStatusTransition>,
        handler: Arc<ReconciliationHandler>,
        registry: Arc<dyn OperationsRegistry>,
        config: RemoteSchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        if config.pool_size == 0 {
            return Err(SchedulerError::Config(
                "worker pool size must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            watcher,
            slot: Slot {
                transition,
                handler,
                registry,
                progress_timeout: config.progress_timeout,
            },
            pool_size: config.pool_size,
        })
    }

    /// Runs until `cancel` fires. Runs already handed to a slot are left to finish on their
    /// own; their workers are bounded by their own wall-clock limit.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let (queue, mut rx) = mpsc::channel::<State>(self.pool_size);
        let watcher = self.watcher.clone();
        let watch_cancel = cancel.clone();
        let watch = tokio::spawn(async move {
            if let Err(e) = watcher.run(queue, watch_cancel).await {
                log::error!("remote_scheduler_watch_failed error={}", e);
            }
        });

        log::info!("remote_scheduler_started pool_size={}", self.pool_size);
        let permits = Arc::new(Semaphore::new(self.pool_size));
        let mut slots = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = slots.join_next(), if !slots.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("remote_scheduler_slot_failed error={}", e);
                    }
                }
                next = rx.recv() => {
                    let Some(state) = next else { break };
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        permit = permits.clone().acquire_owned() => permit
                            .map_err(|e| SchedulerError::Join(e.to_string()))?,
                    };
                    let slot = self.slot.clone();
                    slots.spawn(async move {
                        slot.reconcile(state).await;
                        drop(permit);
                    });
                }
            }
        }

        log::info!(
            "remote_scheduler_stopped running_slots={}",
            slots.len()
        );
        slots.detach_all();
        if let Err(e) = watch.await {
            log::error!("remote_scheduler_watch_join_failed error={}", e);
        }
        Ok(())
    }
}

impl Slot {
    async fn reconcile(&self, state: State) {
        let (entity, state) = match self.transition.start_reconciliation(&state) {
            Ok(Some(started)) => started,
            Ok(None) => return,
            Err(e) => {
                log::error!(
                    "remote_scheduler_start_failed runtime_id={} error={}",
                    state.runtime_id(),
                    e
                );
                return;
            }
        };
        let scheduling_id = entity.scheduling_id;
        let runtime_id = state.runtime_id().to_string();
        let components = state.configuration.component_names();
        if components.is_empty() {
            log::info!("remote_scheduler_no_components runtime_id={}", runtime_id);
            if let Err(e) = self
                .transition
                .finish_reconciliation(&scheduling_id, RunOutcome::Success)
            {
                log::error!(
                    "remote_scheduler_finish_failed runtime_id={} error={}",
                    runtime_id,
                    e
                );
            }
            return;
        }

        let sink = Arc::new(TransitionSink::new(
            self.transition.clone(),
            runtime_id.as_str(),
            scheduling_id.as_str(),
        ));
        // Workers and the aggregation outlive a scheduler shutdown.
        let updater = ClusterStatusUpdater::spawn(
            sink,
            runtime_id.as_str(),
            &components,
            self.progress_timeout,
            CancellationToken::new(),
        );
        if let Err(e) = self
            .handler
            .reconcile(&state, &scheduling_id, Some(&updater), CancellationToken::new())
            .await
        {
            log::warn!(
                "remote_scheduler_run_failed runtime_id={} scheduling_id={} error={}",
                runtime_id,
                scheduling_id,
                e
            );
        }
        let concluded = match updater.finish().await {
            Some(status) => Some(status),
            None => self.finish_abandoned(&runtime_id, &scheduling_id),
        };
        if let Err(e) = self.registry.release_scheduling(&scheduling_id) {
            log::warn!(
                "remote_scheduler_release_failed scheduling_id={} error={}",
                scheduling_id,
                e
            );
        }
        log::info!(
            "remote_scheduler_run_finished runtime_id={} scheduling_id={} status={}",
            runtime_id,
            scheduling_id,
            concluded.map(|s| s.to_string()).unwrap_or_else(|| "unchanged".to_string())
        );
    }

    /// Finishes a run the status updater left open as failed, so the record does not block
    /// the next run of the cluster.
    fn finish_abandoned(&self, runtime_id: &str, scheduling_id: &str) -> Option<ClusterStatus> {
        let repository = self.transition.repository();
        match repository.get_reconciliation(scheduling_id) {
            Ok(entity) if entity.finished => return None,
            Ok(_) => {}
            Err(e) => {
                log::error!(
                    "remote_scheduler_lookup_failed runtime_id={} scheduling_id={} error={}",
                    runtime_id,
                    scheduling_id,
                    e
                );
                return None;
            }
        }
        match self
            .transition
            .finish_reconciliation(scheduling_id, RunOutcome::Failure)
        {
            Ok(state) => {
                log::warn!(
                    "remote_scheduler_run_abandoned runtime_id={} scheduling_id={} status={}",
                    runtime_id,
                    scheduling_id,
                    state.status.status
                );
                Some(state.status.status)
            }
            Err(e) => {
                log::error!(
                    "remote_scheduler_finish_failed runtime_id={} scheduling_id={} error={}",
                    runtime_id,
                    scheduling_id,
                    e
                );
                None
            }
        }
    }
}

#[cfg(all(test, feature = "sqlite-persistence"))]
mod tests {
    use super::*;
    use crate::handler::tests::RecordingFactory;
    use crate::handler::ComponentOrder;
    use crate::inventory_watch::InventoryWatchConfig;
    use crate::operations::InMemoryOperationsRegistry;
    use crate::transition::tests::{cluster_spec, transition};
    use crate::transition::TransitionConfig;
    use crate::worker::{ComponentRun, ReconciliationWorker};
    use crate::worker_factory::WorkerFactory;
    use mothership_inventory::{ClusterStatus, Inventory};

    fn watcher(inventory: mothership_inventory::SharedInventory) -> InventoryWatcher {
        InventoryWatcher::new(
            inventory,
            InventoryWatchConfig {
                watch_interval: Duration::from_millis(20),
                reconcile_interval: DEFAULT_PROGRESS_TIMEOUT,
            },
        )
    }

    #[test]
    fn empty_pool_is_rejected() {
        let (transition, inventory) = transition(TransitionConfig::default());
        let handler = ReconciliationHandler::new(
            Arc::new(RecordingFactory::default()),
            ComponentOrder::default(),
        );
        let result = RemoteScheduler::new(
            watcher(inventory),
            Arc::new(transition),
            Arc::new(handler),
            Arc::new(InMemoryOperationsRegistry::new()),
            RemoteSchedulerConfig {
                pool_size: 0,
                ..RemoteSchedulerConfig::default()
            },
        );
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[tokio::test]
    async fn pending_clusters_end_up_ready() {
        let (transition, inventory) = transition(TransitionConfig::default());
        for id in ["rt-1", "rt-2"] {
            inventory
                .create_or_update(1, &cluster_spec(id, &["CRDs", "istio", "ory"]))
                .expect("create");
        }
        let factory = Arc::new(RecordingFactory::default());
        let scheduler = RemoteScheduler::new(
            watcher(inventory.clone()),
            Arc::new(transition),
            Arc::new(ReconciliationHandler::new(
                factory.clone(),
                ComponentOrder::default(),
            )),
            Arc::new(InMemoryOperationsRegistry::new()),
            RemoteSchedulerConfig {
                pool_size: 2,
                ..RemoteSchedulerConfig::default()
            },
        )
        .expect("scheduler");

        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        let ready = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let statuses: Vec<ClusterStatus> = ["rt-1", "rt-2"]
                    .iter()
                    .map(|id| inventory.get_latest(id).expect("latest").status.status)
                    .collect();
                if statuses.iter().all(|s| *s == ClusterStatus::Ready) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        cancel.cancel();
        run.await.expect("join").expect("run");
        assert!(ready.is_ok(), "clusters did not become ready");
        assert_eq!(factory.order().len(), 6);
    }

    /// Workers whose task dies without reporting an outcome.
    struct PanickingFactory;

    struct PanickingWorker;

    #[async_trait::async_trait]
    impl ReconciliationWorker for PanickingWorker {
        async fn reconcile(
            &self,
            run: &ComponentRun,
            _cancel: CancellationToken,
        ) -> Result<(), SchedulerError> {
            if run.name() == "ory" {
                panic!("worker for {} died", run.name());
            }
            Ok(())
        }
    }

    impl WorkerFactory for PanickingFactory {
        fn for_component(
            &self,
            _component: &str,
        ) -> Result<Box<dyn ReconciliationWorker>, SchedulerError> {
            Ok(Box::new(PanickingWorker))
        }
    }

    #[tokio::test]
    async fn run_without_conclusion_is_finished_as_failed() {
        let (transition, inventory) = transition(TransitionConfig::default());
        let transition = Arc::new(transition);
        let state = inventory
            .create_or_update(1, &cluster_spec("rt-1", &["CRDs", "istio", "ory"]))
            .expect("create");
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let slot = Slot {
            transition: transition.clone(),
            handler: Arc::new(ReconciliationHandler::new(
                Arc::new(PanickingFactory),
                ComponentOrder::default(),
            )),
            registry,
            progress_timeout: DEFAULT_PROGRESS_TIMEOUT,
        };

        slot.reconcile(state.clone()).await;

        let runs = transition
            .repository()
            .get_reconciliations(false)
            .expect("reconciliations");
        assert_eq!(runs.len(), 1);
        assert!(runs[0].finished);
        let latest = inventory.get_latest("rt-1").expect("latest");
        assert_eq!(latest.status.status, ClusterStatus::ReconcileErrorRetryable);

        let (entity, _) = transition
            .start_reconciliation(&latest)
            .expect("start")
            .expect("cluster is schedulable again");
        assert_ne!(entity.scheduling_id, runs[0].scheduling_id);
    }
}
