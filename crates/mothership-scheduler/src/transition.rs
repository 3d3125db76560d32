//! Atomic start and finish of a cluster's scheduling run.

use std::sync::Arc;

use mothership_inventory::{
    transaction, ClusterStatus, Connection, Inventory, ReconciliationKind, SharedInventory, State,
};

use crate::error::SchedulerError;
use crate::reconciliation::{
    ReconciliationEntity, ReconciliationRepository, SharedReconciliationRepository,
};

pub const DEFAULT_STATUS_MAX_RETRIES: usize = 5;

/// Aggregated outcome of all components of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionConfig {
    /// Failed runs of a configuration reported as retryable before the error becomes final.
    pub max_retries: usize,
    /// Remove clusters from the inventory once their delete run succeeded.
    pub purge_deleted: bool,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_STATUS_MAX_RETRIES,
            purge_deleted: false,
        }
    }
}

pub struct ClusterStatusTransition {
    conn: Arc<dyn Connection + Send + Sync>,
    inventory: SharedInventory,
    repository: SharedReconciliationRepository,
    config: TransitionConfig,
}

impl ClusterStatusTransition {
    pub fn new(
        conn: Arc<dyn Connection + Send + Sync>,
        inventory: SharedInventory,
        repository: SharedReconciliationRepository,
        config: TransitionConfig,
    ) -> Self {
        Self {
            conn,
            inventory,
            repository,
            config,
        }
    }

    pub fn inventory(&self) -> SharedInventory {
        self.inventory.clone()
    }

    pub fn repository(&self) -> SharedReconciliationRepository {
        self.repository.clone()
    }

    /// Records a new run and moves the cluster into its running status. Returns `None` when
    /// the cluster already has an unfinished run or `state` is no longer its latest state.
    pub fn start_reconciliation(
        &self,
        state: &State,
    ) -> Result<Option<(ReconciliationEntity, State)>, SchedulerError> {
        let running = ReconciliationKind::for_status(state.status.status).running_status();
        transaction(&*self.conn, |tx| {
            let repository = self.repository.with_tx(tx);
            let latest = self.inventory.with_tx(tx).get_latest(state.runtime_id())?;
            if latest.status.id != state.status.id {
                log::debug!(
                    "transition_stale_state runtime_id={} queued_status_id={} latest_status_id={}",
                    state.runtime_id(),
                    state.status.id,
                    latest.status.id
                );
                return Ok(None);
            }
            let entity = match repository.create_reconciliation(state) {
                Ok(entity) => entity,
                Err(SchedulerError::DuplicateReconciliation { scheduling_id, .. }) => {
                    log::info!(
                        "transition_already_enqueued runtime_id={} scheduling_id={}",
                        state.runtime_id(),
                        scheduling_id
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            let state = self.inventory.with_tx(tx).update_status(state, running)?;
            log::debug!(
                "transition_started runtime_id={} scheduling_id={} status={}",
                state.runtime_id(),
                entity.scheduling_id,
                running
            );
            Ok(Some((entity, state)))
        })
    }

    /// Concludes the run with the status matching its kind and `outcome`.
    pub fn finish_reconciliation(
        &self,
        scheduling_id: &str,
        outcome: RunOutcome,
    ) -> Result<State, SchedulerError> {
        let state = transaction(&*self.conn, |tx| {
            let repository = self.repository.with_tx(tx);
            let inventory = self.inventory.with_tx(tx);
            let entity = repository.get_reconciliation(scheduling_id)?;
            let state = inventory.get(&entity.runtime_id, entity.config_version)?;
            let kind = ReconciliationKind::for_status(state.status.status);
            let status = match outcome {
                RunOutcome::Success => kind.success_status(),
                RunOutcome::Failure => {
                    let retries = inventory.count_retries(
                        &entity.runtime_id,
                        entity.config_version,
                        self.config.max_retries * 2 + 2,
                        &[kind.error_status(true), kind.error_status(false)],
                    )?;
                    kind.error_status(retries < self.config.max_retries)
                }
            };
            let state = inventory.update_status(&state, status)?;
            repository.finish_reconciliation(scheduling_id, state.status.id)?;
            if status == ClusterStatus::Deleted && self.config.purge_deleted {
                inventory.delete(&entity.runtime_id)?;
            }
            Ok::<_, SchedulerError>(state)
        })?;
        log::info!(
            "transition_finished runtime_id={} scheduling_id={} status={}",
            state.runtime_id(),
            scheduling_id,
            state.status.status
        );
        Ok(state)
    }
}

#[cfg(all(test, feature = "sqlite-persistence"))]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;
    use crate::reconciliation::DefaultReconciliationRepository;
    use mothership_inventory::{
        ClusterSpec, Component, DefaultInventory, KymaConfig, RuntimeInput, SqliteConnection,
    };

    pub(crate) fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("mothership-scheduler-{}.db", uuid::Uuid::new_v4()))
    }

    pub(crate) fn cluster_spec(runtime_id: &str, components: &[&str]) -> ClusterSpec {
        ClusterSpec {
            runtime_id: runtime_id.to_string(),
            runtime_input: RuntimeInput {
                name: runtime_id.to_string(),
                description: String::new(),
            },
            metadata: json!({"region": "eu"}),
            kubeconfig: "apiVersion: v1".to_string(),
            kyma_config: KymaConfig {
                version: "2.0.0".to_string(),
                profile: "evaluation".to_string(),
                components: components
                    .iter()
                    .map(|c| Component::new(*c, "kyma-system"))
                    .collect(),
                administrators: vec![],
            },
        }
    }

    pub(crate) fn transition(config: TransitionConfig) -> (ClusterStatusTransition, SharedInventory) {
        let conn: Arc<dyn Connection + Send + Sync> =
            Arc::new(SqliteConnection::open(temp_db_path()).expect("open sqlite"));
        let inventory: SharedInventory =
            Arc::new(DefaultInventory::new(conn.clone()).expect("inventory"));
        let repository = Arc::new(DefaultReconciliationRepository::new(conn.clone()));
        (
            ClusterStatusTransition::new(conn, inventory.clone(), repository, config),
            inventory,
        )
    }

    #[test]
    fn start_is_atomic_and_deduplicated() {
        let (transition, inventory) = transition(TransitionConfig::default());
        let state = inventory
            .create_or_update(1, &cluster_spec("rt-1", &["istio"]))
            .expect("create");

        let (entity, started) = transition
            .start_reconciliation(&state)
            .expect("start")
            .expect("new run");
        assert_eq!(started.status.status, ClusterStatus::Reconciling);
        assert_eq!(entity.runtime_id, "rt-1");

        assert!(transition
            .start_reconciliation(&state)
            .expect("second start")
            .is_none());
        assert_eq!(
            transition
                .repository()
                .get_reconciliations(true)
                .expect("active")
                .len(),
            1
        );
    }

    #[test]
    fn finish_maps_outcome_to_status() {
        let (transition, inventory) = transition(TransitionConfig::default());
        let state = inventory
            .create_or_update(1, &cluster_spec("rt-1", &["istio"]))
            .expect("create");
        let (entity, _) = transition
            .start_reconciliation(&state)
            .expect("start")
            .expect("new run");

        let finished = transition
            .finish_reconciliation(&entity.scheduling_id, RunOutcome::Success)
            .expect("finish");
        assert_eq!(finished.status.status, ClusterStatus::Ready);
        let record = transition
            .repository()
            .get_reconciliation(&entity.scheduling_id)
            .expect("record");
        assert!(record.finished);
        assert_eq!(record.status_id, finished.status.id);
    }

    #[test]
    fn repeated_failures_become_final() {
        let (transition, inventory) = transition(TransitionConfig {
            max_retries: 2,
            purge_deleted: false,
        });
        let mut state = inventory
            .create_or_update(1, &cluster_spec("rt-1", &["istio"]))
            .expect("create");

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (entity, _) = transition
                .start_reconciliation(&state)
                .expect("start")
                .expect("new run");
            state = transition
                .finish_reconciliation(&entity.scheduling_id, RunOutcome::Failure)
                .expect("finish");
            seen.push(state.status.status);
        }
        assert_eq!(
            seen,
            vec![
                ClusterStatus::ReconcileErrorRetryable,
                ClusterStatus::ReconcileErrorRetryable,
                ClusterStatus::ReconcileError,
            ]
        );
    }

    #[test]
    fn delete_runs_purge_when_configured() {
        let (transition, inventory) = transition(TransitionConfig {
            max_retries: DEFAULT_STATUS_MAX_RETRIES,
            purge_deleted: true,
        });
        inventory
            .create_or_update(1, &cluster_spec("rt-1", &["istio"]))
            .expect("create");
        let state = inventory.mark_for_deletion("rt-1").expect("mark");

        let (entity, started) = transition
            .start_reconciliation(&state)
            .expect("start")
            .expect("new run");
        assert_eq!(started.status.status, ClusterStatus::Deleting);
        let finished = transition
            .finish_reconciliation(&entity.scheduling_id, RunOutcome::Success)
            .expect("finish");
        assert_eq!(finished.status.status, ClusterStatus::Deleted);
        assert!(inventory
            .get_latest("rt-1")
            .expect_err("purged")
            .is_not_found());
    }
}
