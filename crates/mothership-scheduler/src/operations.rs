//! Registry of in-flight component operations.
//!
//! Each operation is keyed by its (correlation id, scheduling id) pair and moves through
//! `New -> InProgress -> {Done, Error, Failed, ClientError}`; `ClientError` may go back to
//! `InProgress` when the worker re-dispatches. `Done` and `Error` are final. `Failed` ends the
//! worker's attempt, but a reconciler that reported `failed` may still report progress or a
//! final result afterwards since it retries on its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OperationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    New,
    InProgress,
    ClientError,
    Done,
    Error,
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "inprogress",
            Self::ClientError => "clienterror",
            Self::Done => "done",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    fn can_become(&self, next: OperationState) -> bool {
        !self.is_final() && next != Self::New
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One component's reconciliation attempt within a scheduling run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub correlation_id: String,
    pub scheduling_id: String,
    pub component: String,
    pub runtime_id: String,
    pub config_version: i64,
    pub state: OperationState,
    pub reason: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Identity of a new operation.
#[derive(Clone, Debug)]
pub struct NewOperation<'a> {
    pub correlation_id: &'a str,
    pub scheduling_id: &'a str,
    pub component: &'a str,
    pub runtime_id: &'a str,
    pub config_version: i64,
}

pub trait OperationsRegistry: Send + Sync {
    /// Registers a `New` operation. Fails if the key is already taken.
    fn register_operation(&self, op: NewOperation<'_>) -> Result<Operation, OperationError>;

    fn get_operation(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
    ) -> Result<Option<Operation>, OperationError>;

    fn get_operations(&self, scheduling_id: &str) -> Result<Vec<Operation>, OperationError>;

    /// Operations of the run that finished successfully, including removed ones.
    fn get_done_operations(&self, scheduling_id: &str) -> Result<Vec<Operation>, OperationError>;

    /// Removes an operation. Fails if it is not registered.
    fn remove_operation(&self, correlation_id: &str, scheduling_id: &str)
        -> Result<(), OperationError>;

    /// Drops everything still kept for a finished run.
    fn release_scheduling(&self, scheduling_id: &str) -> Result<(), OperationError>;

    fn set_state(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
        state: OperationState,
        reason: &str,
    ) -> Result<Operation, OperationError>;

    fn set_in_progress(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
    ) -> Result<Operation, OperationError> {
        self.set_state(correlation_id, scheduling_id, OperationState::InProgress, "")
    }

    fn set_done(&self, correlation_id: &str, scheduling_id: &str) -> Result<Operation, OperationError> {
        self.set_state(correlation_id, scheduling_id, OperationState::Done, "")
    }

    fn set_error(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
        reason: &str,
    ) -> Result<Operation, OperationError> {
        self.set_state(correlation_id, scheduling_id, OperationState::Error, reason)
    }

    fn set_failed(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
        reason: &str,
    ) -> Result<Operation, OperationError> {
        self.set_state(correlation_id, scheduling_id, OperationState::Failed, reason)
    }

    fn set_client_error(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
        reason: &str,
    ) -> Result<Operation, OperationError> {
        self.set_state(correlation_id, scheduling_id, OperationState::ClientError, reason)
    }
}

#[derive(Default)]
struct RegistryState {
    // scheduling id -> correlation id -> operation
    active: HashMap<String, HashMap<String, Operation>>,
    done: HashMap<String, Vec<Operation>>,
}

/// Process-local registry. Every access goes through one mutex.
#[derive(Default)]
pub struct InMemoryOperationsRegistry {
    state: Mutex<RegistryState>,
}

impl InMemoryOperationsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>, OperationError> {
        self.state
            .lock()
            .map_err(|_| OperationError::Registry("registry lock poisoned".into()))
    }

    #[cfg(test)]
    fn retained_schedulings(&self) -> usize {
        let state = self.state.lock().expect("registry lock");
        state.active.len() + state.done.len()
    }
}

fn not_found(correlation_id: &str, scheduling_id: &str) -> OperationError {
    OperationError::NotFound {
        scheduling_id: scheduling_id.to_string(),
        correlation_id: correlation_id.to_string(),
    }
}

impl OperationsRegistry for InMemoryOperationsRegistry {
    fn register_operation(&self, op: NewOperation<'_>) -> Result<Operation, OperationError> {
        let mut state = self.lock()?;
        let ops = state.active.entry(op.scheduling_id.to_string()).or_default();
        if ops.contains_key(op.correlation_id) {
            return Err(OperationError::AlreadyRegistered {
                scheduling_id: op.scheduling_id.to_string(),
                correlation_id: op.correlation_id.to_string(),
            });
        }
        let now = Utc::now();
        let operation = Operation {
            correlation_id: op.correlation_id.to_string(),
            scheduling_id: op.scheduling_id.to_string(),
            component: op.component.to_string(),
            runtime_id: op.runtime_id.to_string(),
            config_version: op.config_version,
            state: OperationState::New,
            reason: String::new(),
            created: now,
            updated: now,
        };
        ops.insert(op.correlation_id.to_string(), operation.clone());
        Ok(operation)
    }

    fn get_operation(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
    ) -> Result<Option<Operation>, OperationError> {
        let state = self.lock()?;
        Ok(state
            .active
            .get(scheduling_id)
            .and_then(|ops| ops.get(correlation_id))
            .cloned())
    }

    fn get_operations(&self, scheduling_id: &str) -> Result<Vec<Operation>, OperationError> {
        let state = self.lock()?;
        let mut ops: Vec<Operation> = state
            .active
            .get(scheduling_id)
            .map(|ops| ops.values().cloned().collect())
            .unwrap_or_default();
        ops.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(ops)
    }

    fn get_done_operations(&self, scheduling_id: &str) -> Result<Vec<Operation>, OperationError> {
        let state = self.lock()?;
        let mut done: Vec<Operation> = state.done.get(scheduling_id).cloned().unwrap_or_default();
        if let Some(ops) = state.active.get(scheduling_id) {
            done.extend(
                ops.values()
                    .filter(|op| op.state == OperationState::Done)
                    .cloned(),
            );
        }
        Ok(done)
    }

    fn remove_operation(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
    ) -> Result<(), OperationError> {
        let mut state = self.lock()?;
        let removed = state
            .active
            .get_mut(scheduling_id)
            .and_then(|ops| ops.remove(correlation_id))
            .ok_or_else(|| not_found(correlation_id, scheduling_id))?;
        if state
            .active
            .get(scheduling_id)
            .is_some_and(|ops| ops.is_empty())
        {
            state.active.remove(scheduling_id);
        }
        if removed.state == OperationState::Done {
            state
                .done
                .entry(scheduling_id.to_string())
                .or_default()
                .push(removed);
        }
        Ok(())
    }

    fn release_scheduling(&self, scheduling_id: &str) -> Result<(), OperationError> {
        let mut state = self.lock()?;
        state.done.remove(scheduling_id);
        // Error and Failed operations are never removed by their worker.
        if let Some(ops) = state.active.remove(scheduling_id) {
            log::debug!(
                "scheduling_released scheduling_id={} dropped_operations={}",
                scheduling_id,
                ops.len()
            );
        }
        Ok(())
    }

    fn set_state(
        &self,
        correlation_id: &str,
        scheduling_id: &str,
        next: OperationState,
        reason: &str,
    ) -> Result<Operation, OperationError> {
        let mut state = self.lock()?;
        let op = state
            .active
            .get_mut(scheduling_id)
            .and_then(|ops| ops.get_mut(correlation_id))
            .ok_or_else(|| not_found(correlation_id, scheduling_id))?;
        if !op.state.can_become(next) {
            return Err(OperationError::InvalidTransition {
                correlation_id: correlation_id.to_string(),
                from: op.state,
                to: next,
            });
        }
        log::debug!(
            "operation_state_changed scheduling_id={} correlation_id={} component={} from={} to={}",
            scheduling_id,
            correlation_id,
            op.component,
            op.state,
            next
        );
        op.state = next;
        op.reason = reason.to_string();
        op.updated = Utc::now();
        Ok(op.clone())
    }
}
