//! Error types of the scheduler.

use mothership_inventory::{InventoryError, StoreError};

use crate::operations::OperationState;

/// Operations registry errors.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("operation '{correlation_id}' of scheduling '{scheduling_id}' already registered")]
    AlreadyRegistered {
        scheduling_id: String,
        correlation_id: String,
    },
    #[error("operation '{correlation_id}' of scheduling '{scheduling_id}' not found")]
    NotFound {
        scheduling_id: String,
        correlation_id: String,
    },
    #[error("operation '{correlation_id}' cannot change from {from} to {to}")]
    InvalidTransition {
        correlation_id: String,
        from: OperationState,
        to: OperationState,
    },
    #[error("Registry error: {0}")]
    Registry(String),
}

/// Failure to hand a component over to its reconciler.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("reconciler at '{0}' reported failed preconditions (428)")]
    PreconditionRequired(String),
    #[error("reconciler at '{url}' rejected request with status {status}")]
    Rejected { url: String, status: u16 },
    #[error("invalid reconciliation request: {0}")]
    Validation(String),
    #[error("Reconciler error: {0}")]
    Reconciler(String),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// Scheduler-level error type.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error("operation '{correlation_id}' of component '{component}' exceeded max retry count ({max_retries})")]
    MaxRetries {
        component: String,
        correlation_id: String,
        max_retries: u32,
    },
    #[error("operation '{correlation_id}' of component '{component}' timed out after {elapsed_secs}s")]
    Timeout {
        component: String,
        correlation_id: String,
        elapsed_secs: u64,
    },
    #[error("context closed while {0}")]
    Cancelled(String),
    #[error("reconciler of component '{component}' failed: {reason}")]
    ReconcilerFailed { component: String, reason: String },
    #[error("no reconciler registered for component '{component}' and no fallback '{fallback}'")]
    NoReconciler { component: String, fallback: String },
    #[error("cluster '{runtime_id}' already has an active reconciliation '{scheduling_id}'")]
    DuplicateReconciliation {
        runtime_id: String,
        scheduling_id: String,
    },
    #[error("reconciliation '{0}' not found")]
    ReconciliationNotFound(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Task error: {0}")]
    Join(String),
}

impl SchedulerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Inventory(e) => e.is_not_found(),
            Self::ReconciliationNotFound(_) => true,
            _ => false,
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        Self::Inventory(InventoryError::Store(err))
    }
}
