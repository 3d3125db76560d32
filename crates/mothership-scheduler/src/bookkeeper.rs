//! Periodic repair of scheduling runs nobody is going to finish.
//!
//! A run stays unfinished when the process dies mid-run or when writing its conclusion fails.
//! Such a record blocks every further run of the cluster, so runs older than the orphan
//! timeout without a live worker are finished as failed, which leaves the cluster retryable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::operations::{OperationState, OperationsRegistry};
use crate::reconciliation::{ReconciliationEntity, ReconciliationRepository};
use crate::transition::{ClusterStatusTransition, RunOutcome};
use crate::worker::DEFAULT_MAX_DURATION;

pub const DEFAULT_BOOKKEEPING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookkeeperConfig {
    pub interval: Duration,
    /// Age after which an unfinished run counts as orphaned. Should not be below the worker
    /// wall-clock limit.
    pub orphan_timeout: Duration,
}

impl Default for BookkeeperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_BOOKKEEPING_INTERVAL,
            orphan_timeout: DEFAULT_MAX_DURATION,
        }
    }
}

pub struct Bookkeeper {
    transition: Arc<ClusterStatusTransition>,
    registry: Arc<dyn OperationsRegistry>,
    config: BookkeeperConfig,
}

impl Bookkeeper {
    pub fn new(
        transition: Arc<ClusterStatusTransition>,
        registry: Arc<dyn OperationsRegistry>,
        config: BookkeeperConfig,
    ) -> Result<Self, SchedulerError> {
        if config.interval.is_zero() {
            return Err(SchedulerError::Config(
                "bookkeeping interval must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            transition,
            registry,
            config,
        })
    }

    /// Finishes orphaned runs right away and then on every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        log::info!(
            "bookkeeper_started interval_secs={} orphan_timeout_secs={}",
            self.config.interval.as_secs(),
            self.config.orphan_timeout.as_secs()
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("bookkeeper_stopped reason=cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.finish_orphans() {
                log::error!("bookkeeper_pass_failed error={}", e);
            }
        }
    }

    /// One bookkeeping pass. Returns the number of runs it finished.
    pub fn finish_orphans(&self) -> Result<usize, SchedulerError> {
        let active = self.transition.repository().get_reconciliations(true)?;
        let mut finished = 0;
        for entity in active {
            if !self.is_orphaned(&entity) {
                continue;
            }
            match self
                .transition
                .finish_reconciliation(&entity.scheduling_id, RunOutcome::Failure)
            {
                Ok(state) => {
                    log::warn!(
                        "bookkeeper_orphan_finished runtime_id={} scheduling_id={} config_version={} status={}",
                        entity.runtime_id,
                        entity.scheduling_id,
                        entity.config_version,
                        state.status.status
                    );
                    finished += 1;
                }
                // Removed together with its cluster.
                Err(e) if e.is_not_found() => {
                    if let Err(e) = self
                        .transition
                        .repository()
                        .remove_reconciliation(&entity.scheduling_id)
                    {
                        log::error!(
                            "bookkeeper_remove_failed scheduling_id={} error={}",
                            entity.scheduling_id,
                            e
                        );
                    }
                }
                Err(e) => log::error!(
                    "bookkeeper_finish_failed runtime_id={} scheduling_id={} error={}",
                    entity.runtime_id,
                    entity.scheduling_id,
                    e
                ),
            }
        }
        Ok(finished)
    }

    fn is_orphaned(&self, entity: &ReconciliationEntity) -> bool {
        let age = (Utc::now() - entity.created).to_std().unwrap_or_default();
        if age < self.config.orphan_timeout {
            return false;
        }
        match self.registry.get_operations(&entity.scheduling_id) {
            Ok(ops) => !ops.iter().any(|op| {
                matches!(
                    op.state,
                    OperationState::New | OperationState::InProgress | OperationState::ClientError
                )
            }),
            Err(e) => {
                log::warn!(
                    "bookkeeper_operations_unavailable scheduling_id={} error={}",
                    entity.scheduling_id,
                    e
                );
                false
            }
        }
    }
}
