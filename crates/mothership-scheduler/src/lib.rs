//! Reconciliation scheduling for the mothership.
//!
//! [`RemoteScheduler`] polls the inventory for due clusters and runs each one through a
//! [`ReconciliationHandler`], which spawns one [`Worker`] per component. Workers dispatch to
//! component reconcilers and follow their progress in the [`OperationsRegistry`]; remote
//! reconcilers report back through the callback router in [`callback`]. The
//! [`ClusterStatusUpdater`] folds component outcomes into the cluster status, persisted through
//! [`ClusterStatusTransition`].
//!
//! [`Bookkeeper`] finishes runs left open by a crash and [`Cleaner`] removes old run records and
//! intermediary statuses.
//!
//! [`LocalScheduler`] runs the same handler in-process against one cluster descriptor.

pub mod api_errors;
pub mod bookkeeper;
pub mod callback;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod handler;
pub mod inventory_watch;
pub mod invoker;
pub mod local_scheduler;
pub mod operations;
pub mod reconciliation;
pub mod remote_scheduler;
pub mod status_updater;
pub mod transition;
pub mod worker;
pub mod worker_factory;

pub use api_errors::ApiError;
pub use bookkeeper::{Bookkeeper, BookkeeperConfig};
pub use callback::{build_router, CallbackApiState};
pub use cleaner::{Cleaner, CleanerConfig, CleanupReport};
pub use config::{SchedulerConfig, StorageBackend};
pub use error::{InvokeError, OperationError, SchedulerError};
pub use handler::{ComponentOrder, ReconciliationHandler, ReconciliationPlan, CRD_COMPONENT};
pub use inventory_watch::{InventoryWatchConfig, InventoryWatcher};
pub use invoker::{
    apply_callback, CallbackEndpoint, CallbackMessage, ComponentReconciler, InvokeParams,
    LocalReconcilerInvoker, LocalTask, ReconcilerInvoker, ReconcilerStatus,
    ReconciliationRequest, RemoteReconcilerInvoker,
};
pub use local_scheduler::LocalScheduler;
pub use operations::{
    InMemoryOperationsRegistry, NewOperation, Operation, OperationState, OperationsRegistry,
};
pub use reconciliation::{
    DefaultReconciliationRepository, ReconciliationEntity, ReconciliationRepository,
    SharedReconciliationRepository, SqlReconciliationRepository,
};
pub use remote_scheduler::{RemoteScheduler, RemoteSchedulerConfig};
pub use status_updater::{ClusterStatusUpdater, ComponentOutcome, StatusSink, TransitionSink};
pub use transition::{ClusterStatusTransition, RunOutcome, TransitionConfig};
pub use worker::{ComponentRun, ReconciliationWorker, Worker, WorkerConfig};
pub use worker_factory::{
    LocalWorkerFactory, ReconcilerRegistry, RemoteWorkerFactory, WorkerFactory,
    DEFAULT_RECONCILER,
};
