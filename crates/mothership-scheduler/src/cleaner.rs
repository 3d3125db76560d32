//! Periodic removal of old reconciliation records and intermediary cluster statuses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use mothership_inventory::Inventory;

use crate::error::SchedulerError;
use crate::reconciliation::{ReconciliationEntity, ReconciliationRepository};
use crate::transition::ClusterStatusTransition;

pub const DEFAULT_CLEANER_INTERVAL: Duration = Duration::from_secs(14 * 60 * 60);
pub const DEFAULT_RETAIN_RECONCILIATIONS: usize = 10;
pub const DEFAULT_MAX_ENTITY_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanerConfig {
    pub interval: Duration,
    /// Newest records kept per cluster. `0` keeps all of them.
    pub retain_reconciliations: usize,
    /// Finished records older than this are removed. `0` disables the age limit.
    pub max_reconciliation_age: Duration,
    /// Statuses older than this are removed. `0` keeps the whole status history.
    pub max_status_age: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CLEANER_INTERVAL,
            retain_reconciliations: DEFAULT_RETAIN_RECONCILIATIONS,
            max_reconciliation_age: DEFAULT_MAX_ENTITY_AGE,
            max_status_age: DEFAULT_MAX_ENTITY_AGE,
        }
    }
}

/// What one cleaning pass removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub reconciliations: usize,
    pub statuses: u64,
}

pub struct Cleaner {
    transition: Arc<ClusterStatusTransition>,
    config: CleanerConfig,
}

impl Cleaner {
    pub fn new(
        transition: Arc<ClusterStatusTransition>,
        config: CleanerConfig,
    ) -> Result<Self, SchedulerError> {
        if config.interval.is_zero() {
            return Err(SchedulerError::Config(
                "cleaner interval must be greater than 0".to_string(),
            ));
        }
        Ok(Self { transition, config })
    }

    /// Cleans right away and then on every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        log::info!(
            "cleaner_started interval_secs={} retain_reconciliations={} max_reconciliation_age_secs={} max_status_age_secs={}",
            self.config.interval.as_secs(),
            self.config.retain_reconciliations,
            self.config.max_reconciliation_age.as_secs(),
            self.config.max_status_age.as_secs()
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("cleaner_stopped reason=cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            match self.purge() {
                Ok(report) => log::info!(
                    "cleaner_pass_finished reconciliations={} statuses={}",
                    report.reconciliations,
                    report.statuses
                ),
                Err(e) => log::error!("cleaner_pass_failed error={}", e),
            }
        }
    }

    /// One cleaning pass.
    pub fn purge(&self) -> Result<CleanupReport, SchedulerError> {
        let reconciliations = self.purge_reconciliations()?;
        let statuses = if self.config.max_status_age.is_zero() {
            0
        } else {
            self.transition
                .inventory()
                .remove_statuses_older_than(self.config.max_status_age)?
        };
        Ok(CleanupReport {
            reconciliations,
            statuses,
        })
    }

    /// Unfinished records and the most recent record of a cluster are never removed.
    fn purge_reconciliations(&self) -> Result<usize, SchedulerError> {
        let repository = self.transition.repository();
        let mut by_runtime: HashMap<String, Vec<ReconciliationEntity>> = HashMap::new();
        for entity in repository.get_reconciliations(false)? {
            by_runtime
                .entry(entity.runtime_id.clone())
                .or_default()
                .push(entity);
        }

        let now = Utc::now();
        let mut removed = 0;
        for (runtime_id, mut records) in by_runtime {
            records.sort_by(|a, b| b.created.cmp(&a.created));
            for (position, entity) in records.iter().enumerate().skip(1) {
                if !entity.finished {
                    continue;
                }
                let age = (now - entity.created).to_std().unwrap_or_default();
                let too_old = !self.config.max_reconciliation_age.is_zero()
                    && age > self.config.max_reconciliation_age;
                let beyond_retained = self.config.retain_reconciliations > 0
                    && position >= self.config.retain_reconciliations;
                if !(too_old || beyond_retained) {
                    continue;
                }
                match repository.remove_reconciliation(&entity.scheduling_id) {
                    Ok(()) => removed += 1,
                    Err(e) => log::error!(
                        "cleaner_remove_failed runtime_id={} scheduling_id={} error={}",
                        runtime_id,
                        entity.scheduling_id,
                        e
                    ),
                }
            }
        }
        Ok(removed)
    }
}
