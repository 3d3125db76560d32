//! Resolution of the reconciler responsible for a component.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SchedulerError;
use crate::invoker::{
    CallbackEndpoint, ComponentReconciler, LocalReconcilerInvoker, RemoteReconcilerInvoker,
};
use crate::operations::OperationsRegistry;
use crate::worker::{ReconciliationWorker, Worker, WorkerConfig};

/// Name of the reconciler used for components without a dedicated one.
pub const DEFAULT_RECONCILER: &str = "base";

pub trait WorkerFactory: Send + Sync {
    fn for_component(&self, component: &str)
        -> Result<Box<dyn ReconciliationWorker>, SchedulerError>;
}

/// Component name to reconciler lookup with one designated fallback entry.
#[derive(Clone, Debug)]
pub struct ReconcilerRegistry<T> {
    entries: HashMap<String, T>,
    fallback: String,
}

impl<T> ReconcilerRegistry<T> {
    /// Fails when `fallback` has no entry.
    pub fn new(
        entries: HashMap<String, T>,
        fallback: impl Into<String>,
    ) -> Result<Self, SchedulerError> {
        let fallback = fallback.into();
        if !entries.contains_key(&fallback) {
            return Err(SchedulerError::Config(format!(
                "no reconciler registered for fallback '{}'",
                fallback
            )));
        }
        Ok(Self { entries, fallback })
    }

    pub fn resolve(&self, component: &str) -> Result<&T, SchedulerError> {
        if let Some(entry) = self.entries.get(component) {
            return Ok(entry);
        }
        log::debug!(
            "reconciler_fallback component={} fallback={}",
            component,
            self.fallback
        );
        self.entries
            .get(&self.fallback)
            .ok_or_else(|| SchedulerError::NoReconciler {
                component: component.to_string(),
                fallback: self.fallback.clone(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Builds workers dispatching over HTTP to the reconciler URL of each component.
pub struct RemoteWorkerFactory {
    reconcilers: ReconcilerRegistry<String>,
    client: reqwest::Client,
    callback: CallbackEndpoint,
    registry: Arc<dyn OperationsRegistry>,
    config: WorkerConfig,
}

impl RemoteWorkerFactory {
    pub fn new(
        reconcilers: ReconcilerRegistry<String>,
        callback: CallbackEndpoint,
        registry: Arc<dyn OperationsRegistry>,
        config: WorkerConfig,
    ) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder()
            .timeout(config.dispatch_timeout)
            .build()
            .map_err(|e| SchedulerError::Config(format!("reconciler http client: {}", e)))?;
        Ok(Self {
            reconcilers,
            client,
            callback,
            registry,
            config,
        })
    }
}

impl WorkerFactory for RemoteWorkerFactory {
    fn for_component(
        &self,
        component: &str,
    ) -> Result<Box<dyn ReconciliationWorker>, SchedulerError> {
        let url = self.reconcilers.resolve(component)?;
        let invoker = RemoteReconcilerInvoker::new(
            self.client.clone(),
            url.clone(),
            self.callback.clone(),
        );
        Ok(Box::new(Worker::new(
            Arc::new(invoker),
            self.registry.clone(),
            self.config.clone(),
        )))
    }
}

/// Builds workers calling reconcilers linked into this process.
pub struct LocalWorkerFactory {
    reconcilers: ReconcilerRegistry<Arc<dyn ComponentReconciler>>,
    registry: Arc<dyn OperationsRegistry>,
    config: WorkerConfig,
}

impl LocalWorkerFactory {
    pub fn new(
        reconcilers: ReconcilerRegistry<Arc<dyn ComponentReconciler>>,
        registry: Arc<dyn OperationsRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            reconcilers,
            registry,
            config,
        }
    }
}

impl WorkerFactory for LocalWorkerFactory {
    fn for_component(
        &self,
        component: &str,
    ) -> Result<Box<dyn ReconciliationWorker>, SchedulerError> {
        let reconciler = self.reconcilers.resolve(component)?.clone();
        let invoker = LocalReconcilerInvoker::new(reconciler, self.registry.clone());
        Ok(Box::new(Worker::new(
            Arc::new(invoker),
            self.registry.clone(),
            self.config.clone(),
        )))
    }
}
