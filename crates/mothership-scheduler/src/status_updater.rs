//! Aggregation of per-component outcomes into one cluster status.
//!
//! All updates of a run go through a channel to a single consumer task, which owns the
//! component map. The cluster status is concluded at most once: before writing, the latest
//! persisted status is re-read and a status that already concluded a run is never replaced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mothership_inventory::{ClusterStatus, Inventory};

use crate::error::SchedulerError;
use crate::transition::{ClusterStatusTransition, RunOutcome};

pub const UPDATE_CHANNEL_SIZE: usize = 100;
pub const DEFAULT_PROGRESS_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Final outcome of one component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentOutcome {
    Done,
    Error,
}

/// Where the aggregated status of a run is read from and written to.
pub trait StatusSink: Send + Sync {
    fn latest_status(&self) -> Result<ClusterStatus, SchedulerError>;

    fn conclude(&self, outcome: RunOutcome) -> Result<ClusterStatus, SchedulerError>;
}

/// Concludes a persisted scheduling run through [`ClusterStatusTransition`].
pub struct TransitionSink {
    transition: Arc<ClusterStatusTransition>,
    runtime_id: String,
    scheduling_id: String,
}

impl TransitionSink {
    pub fn new(
        transition: Arc<ClusterStatusTransition>,
        runtime_id: impl Into<String>,
        scheduling_id: impl Into<String>,
    ) -> Self {
        Self {
            transition,
            runtime_id: runtime_id.into(),
            scheduling_id: scheduling_id.into(),
        }
    }
}

impl StatusSink for TransitionSink {
    fn latest_status(&self) -> Result<ClusterStatus, SchedulerError> {
        Ok(self
            .transition
            .inventory()
            .get_latest(&self.runtime_id)?
            .status
            .status)
    }

    fn conclude(&self, outcome: RunOutcome) -> Result<ClusterStatus, SchedulerError> {
        let state = self
            .transition
            .finish_reconciliation(&self.scheduling_id, outcome)?;
        Ok(state.status.status)
    }
}

struct ComponentUpdate {
    component: String,
    outcome: ComponentOutcome,
}

pub struct ClusterStatusUpdater {
    updates: mpsc::Sender<ComponentUpdate>,
    task: JoinHandle<Option<ClusterStatus>>,
}

impl ClusterStatusUpdater {
    /// Starts the consumer task for a run over `components`.
    pub fn spawn(
        sink: Arc<dyn StatusSink>,
        runtime_id: impl Into<String>,
        components: &[String],
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (updates, rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);
        let aggregator = Aggregator {
            sink,
            runtime_id: runtime_id.into(),
            components: components.iter().map(|c| (c.clone(), None)).collect(),
            concluded: None,
        };
        let task = tokio::spawn(aggregator.run(rx, timeout, cancel));
        Self { updates, task }
    }

    pub async fn update(&self, component: &str, outcome: ComponentOutcome) {
        let update = ComponentUpdate {
            component: component.to_string(),
            outcome,
        };
        if self.updates.send(update).await.is_err() {
            log::debug!(
                "status_updater_closed component={} outcome={:?}",
                component,
                outcome
            );
        }
    }

    /// Closes the channel and waits for the consumer. Returns the status the run concluded
    /// with, if this updater wrote one.
    pub async fn finish(self) -> Option<ClusterStatus> {
        drop(self.updates);
        match self.task.await {
            Ok(concluded) => concluded,
            Err(e) => {
                log::error!("status_updater_task_failed error={}", e);
                None
            }
        }
    }
}

struct Aggregator {
    sink: Arc<dyn StatusSink>,
    runtime_id: String,
    components: HashMap<String, Option<ComponentOutcome>>,
    concluded: Option<ClusterStatus>,
}

impl Aggregator {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ComponentUpdate>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Option<ClusterStatus> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("status_updater_cancelled runtime_id={}", self.runtime_id);
                    return self.concluded;
                }
                _ = &mut deadline => {
                    log::error!(
                        "status_updater_timeout runtime_id={} timeout_secs={}",
                        self.runtime_id,
                        timeout.as_secs()
                    );
                    self.conclude(RunOutcome::Failure);
                    return self.concluded;
                }
                update = rx.recv() => {
                    let Some(update) = update else {
                        return self.concluded;
                    };
                    self.apply(update);
                    if self.all_final() {
                        return self.concluded;
                    }
                }
            }
        }
    }

    fn apply(&mut self, update: ComponentUpdate) {
        match self.components.get_mut(&update.component) {
            Some(slot) => *slot = Some(update.outcome),
            None => {
                log::warn!(
                    "status_updater_unknown_component runtime_id={} component={}",
                    self.runtime_id,
                    update.component
                );
                return;
            }
        }
        match update.outcome {
            ComponentOutcome::Done if self.all_done() => self.conclude(RunOutcome::Success),
            ComponentOutcome::Done => {}
            ComponentOutcome::Error => self.conclude(RunOutcome::Failure),
        }
    }

    fn conclude(&mut self, outcome: RunOutcome) {
        match self.sink.latest_status() {
            Ok(current) if current.is_final() => {
                log::warn!(
                    "status_updater_change_refused runtime_id={} outcome={:?} current={}",
                    self.runtime_id,
                    outcome,
                    current
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!(
                    "status_updater_latest_status_failed runtime_id={} error={}",
                    self.runtime_id,
                    e
                );
                return;
            }
        }
        match self.sink.conclude(outcome) {
            Ok(status) => {
                log::info!(
                    "status_updater_concluded runtime_id={} status={}",
                    self.runtime_id,
                    status
                );
                self.concluded = Some(status);
            }
            Err(e) => log::error!(
                "status_updater_conclude_failed runtime_id={} outcome={:?} error={}",
                self.runtime_id,
                outcome,
                e
            ),
        }
    }

    fn all_done(&self) -> bool {
        self.components
            .values()
            .all(|o| *o == Some(ComponentOutcome::Done))
    }

    fn all_final(&self) -> bool {
        self.components.values().all(Option::is_some)
    }
}
