//! Reconciles a single cluster in-process, without inventory or callbacks over the network.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use mothership_inventory::{
    ClusterEntity, ClusterSpec, ClusterStatus, ConfigurationEntity, State, StatusEntity,
};

use crate::error::SchedulerError;
use crate::handler::{ComponentOrder, ReconciliationHandler};
use crate::invoker::ComponentReconciler;
use crate::operations::{InMemoryOperationsRegistry, OperationsRegistry};
use crate::worker::WorkerConfig;
use crate::worker_factory::{LocalWorkerFactory, ReconcilerRegistry};

const LOCAL_CONTRACT_VERSION: i64 = 1;

pub struct LocalScheduler {
    handler: ReconciliationHandler,
    registry: Arc<InMemoryOperationsRegistry>,
}

impl LocalScheduler {
    pub fn new(
        reconcilers: ReconcilerRegistry<Arc<dyn ComponentReconciler>>,
        order: ComponentOrder,
        config: WorkerConfig,
    ) -> Self {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let factory = LocalWorkerFactory::new(reconcilers, registry.clone(), config);
        Self {
            handler: ReconciliationHandler::new(Arc::new(factory), order),
            registry,
        }
    }

    pub fn registry(&self) -> Arc<InMemoryOperationsRegistry> {
        self.registry.clone()
    }

    /// Reconciles every component of `spec` and returns the first failure.
    pub async fn run(
        &self,
        spec: &ClusterSpec,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        let scheduling_id = uuid::Uuid::new_v4().to_string();
        let state = local_state(spec)?;
        log::info!(
            "local_scheduler_started runtime_id={} scheduling_id={} components={}",
            spec.runtime_id,
            scheduling_id,
            spec.kyma_config.components.len()
        );
        let result = self
            .handler
            .reconcile(&state, &scheduling_id, None, cancel)
            .await;
        if let Err(e) = self.registry.release_scheduling(&scheduling_id) {
            log::warn!(
                "local_scheduler_release_failed scheduling_id={} error={}",
                scheduling_id,
                e
            );
        }
        result
    }
}

/// Unpersisted state for `spec`, as the handler expects it.
fn local_state(spec: &ClusterSpec) -> Result<State, SchedulerError> {
    if spec.runtime_id.trim().is_empty() {
        return Err(SchedulerError::Config(
            "cluster spec without runtime id".to_string(),
        ));
    }
    let now = Utc::now();
    Ok(State {
        cluster: ClusterEntity {
            version: 0,
            runtime_id: spec.runtime_id.clone(),
            runtime: spec.runtime_input.clone(),
            metadata: spec.metadata.clone(),
            kubeconfig: spec.kubeconfig.clone(),
            contract: LOCAL_CONTRACT_VERSION,
            created: now,
        },
        configuration: ConfigurationEntity {
            version: 0,
            runtime_id: spec.runtime_id.clone(),
            cluster_version: 0,
            kyma_version: spec.kyma_config.version.clone(),
            kyma_profile: spec.kyma_config.profile.clone(),
            components: spec.kyma_config.components.clone(),
            administrators: spec.kyma_config.administrators.clone(),
            contract: LOCAL_CONTRACT_VERSION,
            created: now,
        },
        status: StatusEntity {
            id: 0,
            runtime_id: spec.runtime_id.clone(),
            cluster_version: 0,
            config_version: 0,
            status: ClusterStatus::ReconcilePending,
            created: now,
        },
    })
}
