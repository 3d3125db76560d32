//! In-process dispatch to component reconcilers linked into the same binary.

use std::sync::Arc;

use async_trait::async_trait;

use super::{apply_callback, CallbackMessage, InvokeParams, ReconcilerInvoker, ReconciliationRequest};
use crate::error::{InvokeError, OperationError};
use crate::operations::OperationsRegistry;

/// Status sink handed to an embedded reconciler.
pub type CallbackFn = Arc<dyn Fn(CallbackMessage) -> Result<(), OperationError> + Send + Sync>;

/// Work item for an embedded reconciler.
pub struct LocalTask {
    pub request: ReconciliationRequest,
    pub callback: CallbackFn,
}

/// A component reconciler running inside this process.
#[async_trait]
pub trait ComponentReconciler: Send + Sync {
    /// Runs the reconciliation, reporting progress and the outcome through `task.callback`.
    async fn reconcile(&self, task: LocalTask) -> Result<(), InvokeError>;
}

pub struct LocalReconcilerInvoker {
    reconciler: Arc<dyn ComponentReconciler>,
    registry: Arc<dyn OperationsRegistry>,
}

impl LocalReconcilerInvoker {
    pub fn new(
        reconciler: Arc<dyn ComponentReconciler>,
        registry: Arc<dyn OperationsRegistry>,
    ) -> Self {
        Self {
            reconciler,
            registry,
        }
    }
}

#[async_trait]
impl ReconcilerInvoker for LocalReconcilerInvoker {
    async fn invoke(&self, params: &InvokeParams) -> Result<(), InvokeError> {
        let request = params.to_request("");
        request.validate(false)?;

        let registry = self.registry.clone();
        let correlation_id = params.correlation_id.clone();
        let scheduling_id = params.scheduling_id.clone();
        let callback: CallbackFn = Arc::new(move |msg: CallbackMessage| {
            apply_callback(registry.as_ref(), &correlation_id, &scheduling_id, &msg).map(|_| ())
        });

        log::debug!(
            "local_invoke component={} scheduling_id={} correlation_id={}",
            request.component,
            params.scheduling_id,
            params.correlation_id
        );
        self.reconciler
            .reconcile(LocalTask { request, callback })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::invoker::testing::state_with;
    use crate::invoker::ReconcilerStatus;
    use crate::operations::{InMemoryOperationsRegistry, NewOperation, OperationState};
    use mothership_inventory::{ClusterStatus, Component};

    struct RecordingReconciler {
        seen: Mutex<Vec<String>>,
        outcome: ReconcilerStatus,
    }

    #[async_trait]
    impl ComponentReconciler for RecordingReconciler {
        async fn reconcile(&self, task: LocalTask) -> Result<(), InvokeError> {
            self.seen
                .lock()
                .expect("seen lock")
                .push(task.request.component.clone());
            (task.callback)(CallbackMessage::new(ReconcilerStatus::Running))?;
            (task.callback)(CallbackMessage::with_error(self.outcome, "boom"))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn callbacks_update_registry_synchronously() {
        let registry: Arc<InMemoryOperationsRegistry> = Arc::new(InMemoryOperationsRegistry::new());
        registry
            .register_operation(NewOperation {
                correlation_id: "corr-1",
                scheduling_id: "sched-1",
                component: "istio",
                runtime_id: "rt-1",
                config_version: 2,
            })
            .expect("register");
        let reconciler = Arc::new(RecordingReconciler {
            seen: Mutex::new(vec![]),
            outcome: ReconcilerStatus::Error,
        });
        let invoker = LocalReconcilerInvoker::new(reconciler.clone(), registry.clone());

        invoker
            .invoke(&InvokeParams {
                component: Component::new("istio", "istio-system"),
                components_ready: vec![],
                state: state_with(&["istio"], ClusterStatus::Reconciling),
                scheduling_id: "sched-1".into(),
                correlation_id: "corr-1".into(),
                install_crd: false,
            })
            .await
            .expect("invoke");

        let op = registry
            .get_operation("corr-1", "sched-1")
            .expect("get")
            .expect("present");
        assert_eq!(op.state, OperationState::Error);
        assert_eq!(op.reason, "boom");
        assert_eq!(*reconciler.seen.lock().expect("seen lock"), vec!["istio"]);
    }
}
