//! Drives one component of a scheduling run to a final operation state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mothership_inventory::{Component, State};

use crate::error::{OperationError, SchedulerError};
use crate::invoker::{InvokeParams, ReconcilerInvoker};
use crate::operations::{NewOperation, OperationState, OperationsRegistry};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 20;
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Poll interval of the operation state.
    pub tick_interval: Duration,
    /// Dispatch failures tolerated before the operation is failed.
    pub max_retries: u32,
    /// Wall-clock bound of one component's reconciliation.
    pub max_duration: Duration,
    /// Request timeout of a remote dispatch.
    pub dispatch_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            max_duration: DEFAULT_MAX_DURATION,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }
}

/// One component of one scheduling run.
#[derive(Clone, Debug)]
pub struct ComponentRun {
    pub component: Component,
    pub state: State,
    pub scheduling_id: String,
    pub install_crd: bool,
}

impl ComponentRun {
    pub fn name(&self) -> &str {
        &self.component.component
    }
}

#[async_trait]
pub trait ReconciliationWorker: Send + Sync {
    /// Returns once the component's operation is done. A reconciler-reported error, retry
    /// exhaustion, timeout and cancellation are returned as errors.
    async fn reconcile(
        &self,
        run: &ComponentRun,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError>;
}

pub struct Worker {
    correlation_id: String,
    invoker: Arc<dyn ReconcilerInvoker>,
    registry: Arc<dyn OperationsRegistry>,
    config: WorkerConfig,
}

enum Step {
    Wait,
    Finished,
}

impl Worker {
    pub fn new(
        invoker: Arc<dyn ReconcilerInvoker>,
        registry: Arc<dyn OperationsRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            invoker,
            registry,
            config,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    fn timed_out(&self, run: &ComponentRun, started: Instant) -> SchedulerError {
        if let Err(e) = self.registry.set_failed(
            &self.correlation_id,
            &run.scheduling_id,
            "max operation time reached",
        ) {
            log::error!(
                "worker_set_failed_error correlation_id={} error={}",
                self.correlation_id,
                e
            );
        }
        SchedulerError::Timeout {
            component: run.name().to_string(),
            correlation_id: self.correlation_id.clone(),
            elapsed_secs: started.elapsed().as_secs(),
        }
    }

    async fn dispatch(&self, run: &ComponentRun) -> Result<(), SchedulerError> {
        let components_ready = self
            .registry
            .get_done_operations(&run.scheduling_id)?
            .into_iter()
            .map(|op| op.component)
            .collect();
        let params = InvokeParams {
            component: run.component.clone(),
            components_ready,
            state: run.state.clone(),
            scheduling_id: run.scheduling_id.clone(),
            correlation_id: self.correlation_id.clone(),
            install_crd: run.install_crd,
        };
        self.invoker.invoke(&params).await?;
        Ok(())
    }

    /// Dispatches and books a failure as `ClientError`. Returns whether the dispatch failed.
    async fn dispatch_counted(&self, run: &ComponentRun) -> Result<bool, SchedulerError> {
        match self.dispatch(run).await {
            Ok(()) => Ok(false),
            Err(err) => {
                log::warn!(
                    "worker_dispatch_failed component={} scheduling_id={} correlation_id={} error={}",
                    run.name(),
                    run.scheduling_id,
                    self.correlation_id,
                    err
                );
                self.registry.set_client_error(
                    &self.correlation_id,
                    &run.scheduling_id,
                    &format!("error when calling the reconciler: {}", err),
                )?;
                Ok(true)
            }
        }
    }

    async fn process(&self, run: &ComponentRun, failures: &mut u32) -> Result<Step, SchedulerError> {
        if *failures > self.config.max_retries {
            if let Err(e) = self.registry.set_failed(
                &self.correlation_id,
                &run.scheduling_id,
                "max retry count reached",
            ) {
                log::error!(
                    "worker_set_failed_error correlation_id={} error={}",
                    self.correlation_id,
                    e
                );
            }
            return Err(SchedulerError::MaxRetries {
                component: run.name().to_string(),
                correlation_id: self.correlation_id.clone(),
                max_retries: self.config.max_retries,
            });
        }

        let Some(op) = self
            .registry
            .get_operation(&self.correlation_id, &run.scheduling_id)?
        else {
            self.registry.register_operation(NewOperation {
                correlation_id: &self.correlation_id,
                scheduling_id: &run.scheduling_id,
                component: run.name(),
                runtime_id: run.state.runtime_id(),
                config_version: run.state.configuration.version,
            })?;
            if self.dispatch_counted(run).await? {
                *failures += 1;
            }
            return Ok(Step::Wait);
        };

        match op.state {
            OperationState::ClientError => {
                if self.dispatch_counted(run).await? {
                    *failures += 1;
                } else if let Err(e) = self
                    .registry
                    .set_in_progress(&self.correlation_id, &run.scheduling_id)
                {
                    // The reconciler may already have reported back.
                    if !matches!(e, OperationError::InvalidTransition { .. }) {
                        return Err(e.into());
                    }
                }
                Ok(Step::Wait)
            }
            OperationState::New | OperationState::InProgress | OperationState::Failed => {
                Ok(Step::Wait)
            }
            OperationState::Error => Err(SchedulerError::ReconcilerFailed {
                component: run.name().to_string(),
                reason: op.reason,
            }),
            OperationState::Done => {
                if let Err(e) = self
                    .registry
                    .remove_operation(&self.correlation_id, &run.scheduling_id)
                {
                    log::error!(
                        "worker_remove_operation_error correlation_id={} error={}",
                        self.correlation_id,
                        e
                    );
                }
                Ok(Step::Finished)
            }
        }
    }
}

#[async_trait]
impl ReconciliationWorker for Worker {
    async fn reconcile(
        &self,
        run: &ComponentRun,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        log::info!(
            "worker_started component={} runtime_id={} scheduling_id={} correlation_id={}",
            run.name(),
            run.state.runtime_id(),
            run.scheduling_id,
            self.correlation_id
        );
        let started = Instant::now();
        let deadline = started + self.config.max_duration;
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        let mut failures = 0u32;

        loop {
            // Both bounds also apply while a dispatch is in flight.
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(SchedulerError::Cancelled(format!(
                        "waiting for component '{}' (correlation id '{}')",
                        run.name(),
                        self.correlation_id
                    )));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.timed_out(run, started));
                }
                step = async {
                    ticker.tick().await;
                    self.process(run, &mut failures).await
                } => step?,
            };

            if let Step::Finished = step {
                log::info!(
                    "worker_finished component={} scheduling_id={} correlation_id={}",
                    run.name(),
                    run.scheduling_id,
                    self.correlation_id
                );
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::InvokeError;
    use crate::invoker::testing::state_with;
    use crate::invoker::{apply_callback, CallbackMessage, ReconcilerStatus};
    use crate::operations::InMemoryOperationsRegistry;
    use mothership_inventory::ClusterStatus;

    /// Fails the first `failures` calls, then reports `outcome` through the registry.
    struct ScriptedInvoker {
        registry: Arc<InMemoryOperationsRegistry>,
        failures: usize,
        outcome: Option<CallbackMessage>,
        calls: AtomicUsize,
        ready_seen: std::sync::Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedInvoker {
        fn new(
            registry: Arc<InMemoryOperationsRegistry>,
            failures: usize,
            outcome: Option<CallbackMessage>,
        ) -> Self {
            Self {
                registry,
                failures,
                outcome,
                calls: AtomicUsize::new(0),
                ready_seen: std::sync::Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl ReconcilerInvoker for ScriptedInvoker {
        async fn invoke(&self, params: &InvokeParams) -> Result<(), InvokeError> {
            self.ready_seen
                .lock()
                .expect("ready lock")
                .push(params.components_ready.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(InvokeError::Transport("connection refused".into()));
            }
            if let Some(msg) = &self.outcome {
                apply_callback(
                    self.registry.as_ref(),
                    &params.correlation_id,
                    &params.scheduling_id,
                    msg,
                )?;
            }
            Ok(())
        }
    }

    /// Accepts the dispatch but never returns from it.
    struct StuckInvoker;

    #[async_trait]
    impl ReconcilerInvoker for StuckInvoker {
        async fn invoke(&self, _params: &InvokeParams) -> Result<(), InvokeError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            tick_interval: Duration::from_millis(1),
            ..WorkerConfig::default()
        }
    }

    fn run(component: &str) -> ComponentRun {
        ComponentRun {
            component: Component::new(component, "kyma-system"),
            state: state_with(&[component], ClusterStatus::Reconciling),
            scheduling_id: "sched-1".into(),
            install_crd: false,
        }
    }

    #[tokio::test]
    async fn successful_operation_is_removed() {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let invoker = Arc::new(ScriptedInvoker::new(
            registry.clone(),
            0,
            Some(CallbackMessage::new(ReconcilerStatus::Success)),
        ));
        let worker = Worker::new(invoker.clone(), registry.clone(), fast_config());

        worker
            .reconcile(&run("istio"), CancellationToken::new())
            .await
            .expect("reconcile");
        assert!(registry
            .get_operation(worker.correlation_id(), "sched-1")
            .expect("get")
            .is_none());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
        let done = registry.get_done_operations("sched-1").expect("done");
        assert_eq!(done[0].component, "istio");
    }

    #[tokio::test]
    async fn dispatch_failures_are_retried() {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let invoker = Arc::new(ScriptedInvoker::new(
            registry.clone(),
            3,
            Some(CallbackMessage::new(ReconcilerStatus::Success)),
        ));
        let worker = Worker::new(invoker.clone(), registry.clone(), fast_config());
        worker
            .reconcile(&run("istio"), CancellationToken::new())
            .await
            .expect("reconcile after retries");
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_operation() {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let invoker = Arc::new(ScriptedInvoker::new(registry.clone(), usize::MAX, None));
        let worker = Worker::new(invoker.clone(), registry.clone(), fast_config());

        let err = worker
            .reconcile(&run("istio"), CancellationToken::new())
            .await
            .expect_err("retries exhausted");
        assert!(matches!(err, SchedulerError::MaxRetries { .. }));
        assert!(err.to_string().contains("max retry count"));
        assert_eq!(
            invoker.calls.load(Ordering::SeqCst),
            DEFAULT_MAX_RETRIES as usize + 1
        );
        let op = registry
            .get_operation(worker.correlation_id(), "sched-1")
            .expect("get")
            .expect("retained");
        assert_eq!(op.state, OperationState::Failed);
    }

    #[tokio::test]
    async fn reconciler_error_is_reported_and_retained() {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let invoker = Arc::new(ScriptedInvoker::new(
            registry.clone(),
            0,
            Some(CallbackMessage::with_error(ReconcilerStatus::Error, "chart broken")),
        ));
        let worker = Worker::new(invoker, registry.clone(), fast_config());
        let err = worker
            .reconcile(&run("istio"), CancellationToken::new())
            .await
            .expect_err("reconciler error");
        assert!(matches!(
            err,
            SchedulerError::ReconcilerFailed { ref reason, .. } if reason == "chart broken"
        ));
        assert!(registry
            .get_operation(worker.correlation_id(), "sched-1")
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn wall_clock_bound_aborts() {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let invoker = Arc::new(ScriptedInvoker::new(registry.clone(), 0, None));
        let config = WorkerConfig {
            tick_interval: Duration::from_millis(5),
            max_retries: DEFAULT_MAX_RETRIES,
            max_duration: Duration::from_millis(30),
            ..WorkerConfig::default()
        };
        let worker = Worker::new(invoker, registry, config);
        let err = worker
            .reconcile(&run("istio"), CancellationToken::new())
            .await
            .expect_err("timeout");
        assert!(matches!(err, SchedulerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_is_distinguished() {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let invoker = Arc::new(ScriptedInvoker::new(registry.clone(), 0, None));
        let worker = Worker::new(invoker, registry, fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = worker
            .reconcile(&run("istio"), cancel)
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("context closed"));
    }

    #[tokio::test]
    async fn stuck_dispatch_is_bounded_by_max_duration() {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let config = WorkerConfig {
            tick_interval: Duration::from_millis(1),
            max_retries: DEFAULT_MAX_RETRIES,
            max_duration: Duration::from_millis(50),
            ..WorkerConfig::default()
        };
        let worker = Worker::new(Arc::new(StuckInvoker), registry.clone(), config);
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            worker.reconcile(&run("istio"), CancellationToken::new()),
        )
        .await
        .expect("worker returns within its bound")
        .expect_err("timeout");
        assert!(matches!(err, SchedulerError::Timeout { .. }));
        let op = registry
            .get_operation(worker.correlation_id(), "sched-1")
            .expect("get")
            .expect("retained");
        assert_eq!(op.state, OperationState::Failed);
        assert_eq!(op.reason, "max operation time reached");
    }

    #[tokio::test]
    async fn stuck_dispatch_stops_on_cancellation() {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let worker = Worker::new(Arc::new(StuckInvoker), registry, fast_config());
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        });
        let err = tokio::time::timeout(Duration::from_secs(2), worker.reconcile(&run("istio"), cancel))
            .await
            .expect("worker returns after cancellation")
            .expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn components_ready_lists_finished_components() {
        let registry = Arc::new(InMemoryOperationsRegistry::new());
        let invoker = Arc::new(ScriptedInvoker::new(
            registry.clone(),
            0,
            Some(CallbackMessage::new(ReconcilerStatus::Success)),
        ));
        for component in ["CRDs", "istio"] {
            Worker::new(invoker.clone(), registry.clone(), fast_config())
                .reconcile(&run(component), CancellationToken::new())
                .await
                .expect("reconcile");
        }
        let seen = invoker.ready_seen.lock().expect("ready lock");
        assert_eq!(seen[0], Vec::<String>::new());
        assert_eq!(seen[1], vec!["CRDs".to_string()]);
    }
}
