//! Fan-out of one cluster's components to workers in dependency order.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use mothership_inventory::{Component, State};

use crate::error::SchedulerError;
use crate::status_updater::{ClusterStatusUpdater, ComponentOutcome};
use crate::worker::{ComponentRun, ReconciliationWorker};
use crate::worker_factory::WorkerFactory;

/// Component installing the custom resource definitions all others depend on.
pub const CRD_COMPONENT: &str = "CRDs";

/// Which components run before the concurrent group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentOrder {
    pub crd_component: String,
    /// Run one after another, in the order of the configuration's component list.
    pub prerequisites: Vec<String>,
    /// Run one after another after the prerequisites, with CRD installation enabled.
    pub crd_components: Vec<String>,
}

impl Default for ComponentOrder {
    fn default() -> Self {
        Self {
            crd_component: CRD_COMPONENT.to_string(),
            prerequisites: Vec::new(),
            crd_components: Vec::new(),
        }
    }
}

/// A component and whether its reconciler installs CRDs.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedComponent {
    pub component: Component,
    pub install_crd: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconciliationPlan {
    pub sequential: Vec<PlannedComponent>,
    pub concurrent: Vec<PlannedComponent>,
}

impl ComponentOrder {
    pub fn plan(&self, components: &[Component]) -> ReconciliationPlan {
        let mut plan = ReconciliationPlan::default();
        let planned = |c: &Component, install_crd: bool| PlannedComponent {
            component: c.clone(),
            install_crd,
        };

        plan.sequential.extend(
            components
                .iter()
                .filter(|c| c.component == self.crd_component)
                .map(|c| planned(c, true)),
        );
        plan.sequential.extend(
            components
                .iter()
                .filter(|c| c.component != self.crd_component && self.is_prerequisite(c))
                .map(|c| planned(c, false)),
        );
        plan.sequential.extend(
            components
                .iter()
                .filter(|c| {
                    c.component != self.crd_component
                        && !self.is_prerequisite(c)
                        && self.is_crd_component(c)
                })
                .map(|c| planned(c, true)),
        );
        plan.concurrent.extend(
            components
                .iter()
                .filter(|c| {
                    c.component != self.crd_component
                        && !self.is_prerequisite(c)
                        && !self.is_crd_component(c)
                })
                .map(|c| planned(c, false)),
        );
        plan
    }

    fn is_prerequisite(&self, c: &Component) -> bool {
        self.prerequisites.contains(&c.component)
    }

    fn is_crd_component(&self, c: &Component) -> bool {
        self.crd_components.contains(&c.component)
    }
}

pub struct ReconciliationHandler {
    factory: Arc<dyn WorkerFactory>,
    order: ComponentOrder,
}

impl ReconciliationHandler {
    pub fn new(factory: Arc<dyn WorkerFactory>, order: ComponentOrder) -> Self {
        Self { factory, order }
    }

    /// Reconciles all components of `state`, reporting each outcome to `updater`.
    ///
    /// A failing sequential component stops the run before the next group starts. Failures in
    /// the concurrent group do not stop the siblings; the first one is returned once all are
    /// joined.
    pub async fn reconcile(
        &self,
        state: &State,
        scheduling_id: &str,
        updater: Option<&ClusterStatusUpdater>,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        let plan = self.order.plan(&state.configuration.components);
        log::info!(
            "handler_started runtime_id={} scheduling_id={} sequential={} concurrent={}",
            state.runtime_id(),
            scheduling_id,
            plan.sequential.len(),
            plan.concurrent.len()
        );

        for planned in plan.sequential {
            let run = component_run(planned, state, scheduling_id);
            let result = match self.factory.for_component(run.name()) {
                Ok(worker) => worker.reconcile(&run, cancel.clone()).await,
                Err(e) => Err(e),
            };
            report(updater, run.name(), &result).await;
            result?;
        }

        let mut tasks = JoinSet::new();
        let mut first_error = None;
        for planned in plan.concurrent {
            let run = component_run(planned, state, scheduling_id);
            let worker = match self.factory.for_component(run.name()) {
                Ok(worker) => worker,
                Err(e) => {
                    report(updater, run.name(), &Err::<(), _>(&e)).await;
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = worker.reconcile(&run, cancel).await;
                (run.component.component, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((component, result)) => {
                    report(updater, &component, &result).await;
                    if let Err(e) = result {
                        first_error.get_or_insert(e);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(SchedulerError::Join(e.to_string()));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn component_run(planned: PlannedComponent, state: &State, scheduling_id: &str) -> ComponentRun {
    ComponentRun {
        component: planned.component,
        state: state.clone(),
        scheduling_id: scheduling_id.to_string(),
        install_crd: planned.install_crd,
    }
}

async fn report<E: std::fmt::Display>(
    updater: Option<&ClusterStatusUpdater>,
    component: &str,
    result: &Result<(), E>,
) {
    let outcome = match result {
        Ok(()) => ComponentOutcome::Done,
        Err(e) => {
            log::warn!("handler_component_failed component={} error={}", component, e);
            ComponentOutcome::Error
        }
    };
    if let Some(updater) = updater {
        updater.update(component, outcome).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::invoker::testing::state_with;
    use crate::status_updater::tests::RecordingSink;
    use crate::status_updater::DEFAULT_PROGRESS_TIMEOUT;
    use mothership_inventory::ClusterStatus;

    /// Records the order in which components start, failing the ones in `failing`.
    #[derive(Default)]
    pub(crate) struct RecordingFactory {
        pub started: Arc<Mutex<Vec<(String, bool)>>>,
        pub failing: HashSet<String>,
    }

    struct RecordingWorker {
        started: Arc<Mutex<Vec<(String, bool)>>>,
        fail: bool,
    }

    #[async_trait]
    impl ReconciliationWorker for RecordingWorker {
        async fn reconcile(
            &self,
            run: &ComponentRun,
            _cancel: CancellationToken,
        ) -> Result<(), SchedulerError> {
            self.started
                .lock()
                .expect("started lock")
                .push((run.name().to_string(), run.install_crd));
            tokio::task::yield_now().await;
            if self.fail {
                return Err(SchedulerError::ReconcilerFailed {
                    component: run.name().to_string(),
                    reason: "scripted".into(),
                });
            }
            Ok(())
        }
    }

    impl WorkerFactory for RecordingFactory {
        fn for_component(
            &self,
            component: &str,
        ) -> Result<Box<dyn ReconciliationWorker>, SchedulerError> {
            Ok(Box::new(RecordingWorker {
                started: self.started.clone(),
                fail: self.failing.contains(component),
            }))
        }
    }

    impl RecordingFactory {
        pub(crate) fn order(&self) -> Vec<String> {
            self.started
                .lock()
                .expect("started lock")
                .iter()
                .map(|(c, _)| c.clone())
                .collect()
        }
    }

    fn order(prerequisites: &[&str]) -> ComponentOrder {
        ComponentOrder {
            prerequisites: prerequisites.iter().map(|c| c.to_string()).collect(),
            ..ComponentOrder::default()
        }
    }

    async fn run_order(components: &[&str], prerequisites: &[&str]) -> Vec<String> {
        let factory = Arc::new(RecordingFactory::default());
        let handler = ReconciliationHandler::new(factory.clone(), order(prerequisites));
        handler
            .reconcile(
                &state_with(components, ClusterStatus::Reconciling),
                "sched-1",
                None,
                CancellationToken::new(),
            )
            .await
            .expect("reconcile");
        factory.order()
    }

    #[tokio::test]
    async fn crds_then_prerequisites_then_rest() {
        assert_eq!(run_order(&["CRDs", "a", "b"], &["b"]).await, ["CRDs", "b", "a"]);
        assert_eq!(
            run_order(&["CRDs", "d", "a", "b"], &["b", "d"]).await,
            ["CRDs", "d", "b", "a"]
        );
    }

    #[test]
    fn plan_flags_crd_installation() {
        let components: Vec<Component> = ["x", "CRDs", "cluster-essentials", "istio"]
            .iter()
            .map(|c| Component::new(*c, "kyma-system"))
            .collect();
        let plan = ComponentOrder {
            crd_component: CRD_COMPONENT.to_string(),
            prerequisites: vec!["istio".into()],
            crd_components: vec!["cluster-essentials".into()],
        }
        .plan(&components);
        let sequential: Vec<(&str, bool)> = plan
            .sequential
            .iter()
            .map(|p| (p.component.component.as_str(), p.install_crd))
            .collect();
        assert_eq!(
            sequential,
            vec![("CRDs", true), ("istio", false), ("cluster-essentials", true)]
        );
        assert_eq!(plan.concurrent.len(), 1);
        assert_eq!(plan.concurrent[0].component.component, "x");
    }

    #[tokio::test]
    async fn failing_prerequisite_stops_the_run() {
        let factory = Arc::new(RecordingFactory {
            failing: HashSet::from(["b".to_string()]),
            ..RecordingFactory::default()
        });
        let handler = ReconciliationHandler::new(factory.clone(), order(&["b"]));
        let sink = RecordingSink::new(ClusterStatus::Reconciling);
        let state = state_with(&["CRDs", "a", "b"], ClusterStatus::Reconciling);
        let updater = ClusterStatusUpdater::spawn(
            sink.clone(),
            "rt-1",
            &state.configuration.component_names(),
            DEFAULT_PROGRESS_TIMEOUT,
            CancellationToken::new(),
        );

        let err = handler
            .reconcile(&state, "sched-1", Some(&updater), CancellationToken::new())
            .await
            .expect_err("prerequisite failed");
        assert!(matches!(err, SchedulerError::ReconcilerFailed { .. }));
        assert_eq!(factory.order(), ["CRDs", "b"]);
        assert_eq!(
            updater.finish().await,
            Some(ClusterStatus::ReconcileErrorRetryable)
        );
    }

    #[tokio::test]
    async fn concurrent_failures_do_not_stop_siblings() {
        let factory = Arc::new(RecordingFactory {
            failing: HashSet::from(["a".to_string()]),
            ..RecordingFactory::default()
        });
        let handler = ReconciliationHandler::new(factory.clone(), ComponentOrder::default());
        let err = handler
            .reconcile(
                &state_with(&["a", "b", "c"], ClusterStatus::Reconciling),
                "sched-1",
                None,
                CancellationToken::new(),
            )
            .await
            .expect_err("a failed");
        assert!(matches!(err, SchedulerError::ReconcilerFailed { .. }));
        let mut started = factory.order();
        started.sort();
        assert_eq!(started, ["a", "b", "c"]);
    }
}
