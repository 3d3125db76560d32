//! Dispatch of one component to its reconciler, in-process or over HTTP.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mothership_inventory::{Component, ReconciliationKind, State};

use crate::error::{InvokeError, OperationError};
use crate::operations::{Operation, OperationsRegistry};

pub mod local;
pub mod remote;

pub use local::{CallbackFn, ComponentReconciler, LocalReconcilerInvoker, LocalTask};
pub use remote::{CallbackEndpoint, RemoteReconcilerInvoker};

/// Branch used for git-hosted components without an explicit version.
const DEFAULT_BRANCH: &str = "main";

/// Everything needed to dispatch one component of a scheduling run.
#[derive(Clone, Debug)]
pub struct InvokeParams {
    pub component: Component,
    pub components_ready: Vec<String>,
    pub state: State,
    pub scheduling_id: String,
    pub correlation_id: String,
    pub install_crd: bool,
}

impl InvokeParams {
    pub fn kind(&self) -> ReconciliationKind {
        ReconciliationKind::for_status(self.state.status.status)
    }

    fn version(&self) -> String {
        if let Some(version) = self.component.version.as_ref().filter(|v| !v.is_empty()) {
            return version.clone();
        }
        match &self.component.url {
            Some(url) if url.ends_with(".git") => DEFAULT_BRANCH.to_string(),
            _ => self.state.configuration.kyma_version.clone(),
        }
    }

    /// Request payload as sent to a component reconciler.
    pub fn to_request(&self, callback_url: impl Into<String>) -> ReconciliationRequest {
        ReconciliationRequest {
            components_ready: self.components_ready.clone(),
            component: self.component.component.clone(),
            namespace: self.component.namespace.clone(),
            version: self.version(),
            profile: self.state.configuration.kyma_profile.clone(),
            configuration: self
                .component
                .configuration
                .iter()
                .map(|entry| ConfigurationPair {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                })
                .collect(),
            kubeconfig: self.state.cluster.kubeconfig.clone(),
            callback_url: callback_url.into(),
            install_crd: self.install_crd,
            correlation_id: self.correlation_id.clone(),
            action: self.kind(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationPair {
    pub key: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRequest {
    #[serde(rename = "componentsReady")]
    pub components_ready: Vec<String>,
    pub component: String,
    pub namespace: String,
    pub version: String,
    pub profile: String,
    pub configuration: Vec<ConfigurationPair>,
    pub kubeconfig: String,
    #[serde(rename = "callbackURL", default)]
    pub callback_url: String,
    #[serde(rename = "installCRD", default)]
    pub install_crd: bool,
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    pub action: ReconciliationKind,
}

impl ReconciliationRequest {
    /// Checks mandatory fields. Remote reconcilers additionally need a callback URL.
    pub fn validate(&self, require_callback: bool) -> Result<(), InvokeError> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("component", &self.component),
            ("namespace", &self.namespace),
            ("version", &self.version),
            ("kubeconfig", &self.kubeconfig),
            ("correlationID", &self.correlation_id),
        ] {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        if require_callback && self.callback_url.trim().is_empty() {
            missing.push("callbackURL");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(InvokeError::Validation(format!(
                "mandatory fields missing: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Status a component reconciler reports back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcilerStatus {
    NotStarted,
    Running,
    Success,
    Error,
    Failed,
}

impl ReconcilerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "notstarted",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ReconcilerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcilerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "notstarted" => Ok(Self::NotStarted),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "failed" => Ok(Self::Failed),
            other => Err(format!("status '{}' not found", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackMessage {
    pub status: ReconcilerStatus,
    #[serde(default)]
    pub error: String,
}

impl CallbackMessage {
    pub fn new(status: ReconcilerStatus) -> Self {
        Self {
            status,
            error: String::new(),
        }
    }

    pub fn with_error(status: ReconcilerStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }
}

/// Records a reconciler's status report on the matching operation.
pub fn apply_callback(
    registry: &dyn OperationsRegistry,
    correlation_id: &str,
    scheduling_id: &str,
    msg: &CallbackMessage,
) -> Result<Operation, OperationError> {
    log::debug!(
        "reconciler_callback scheduling_id={} correlation_id={} status={}",
        scheduling_id,
        correlation_id,
        msg.status
    );
    match msg.status {
        ReconcilerStatus::NotStarted | ReconcilerStatus::Running => {
            registry.set_in_progress(correlation_id, scheduling_id)
        }
        ReconcilerStatus::Success => registry.set_done(correlation_id, scheduling_id),
        ReconcilerStatus::Error => registry.set_error(correlation_id, scheduling_id, &msg.error),
        ReconcilerStatus::Failed => registry.set_failed(correlation_id, scheduling_id, &msg.error),
    }
}

/// Hands a component over to its reconciler. `Ok` means the reconciler accepted the work;
/// its outcome arrives later through the operations registry.
#[async_trait]
pub trait ReconcilerInvoker: Send + Sync {
    async fn invoke(&self, params: &InvokeParams) -> Result<(), InvokeError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;
    use serde_json::json;

    use mothership_inventory::{
        ClusterEntity, ClusterStatus, Component, ConfigurationEntity, RuntimeInput, State,
        StatusEntity,
    };

    pub fn state_with(components: &[&str], status: ClusterStatus) -> State {
        let now = Utc::now();
        State {
            cluster: ClusterEntity {
                version: 1,
                runtime_id: "rt-1".into(),
                runtime: RuntimeInput {
                    name: "rt-1".into(),
                    description: String::new(),
                },
                metadata: json!({}),
                kubeconfig: "apiVersion: v1".into(),
                contract: 1,
                created: now,
            },
            configuration: ConfigurationEntity {
                version: 2,
                runtime_id: "rt-1".into(),
                cluster_version: 1,
                kyma_version: "2.0.0".into(),
                kyma_profile: "evaluation".into(),
                components: components
                    .iter()
                    .map(|name| Component::new(*name, "kyma-system"))
                    .collect(),
                administrators: vec![],
                contract: 1,
                created: now,
            },
            status: StatusEntity {
                id: 3,
                runtime_id: "rt-1".into(),
                cluster_version: 1,
                config_version: 2,
                status,
                created: now,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::state_with;
    use super::*;
    use crate::operations::{InMemoryOperationsRegistry, NewOperation, OperationState};
    use mothership_inventory::ClusterStatus;

    fn params(component: Component) -> InvokeParams {
        InvokeParams {
            component,
            components_ready: vec!["CRDs".into()],
            state: state_with(&["istio"], ClusterStatus::ReconcilePending),
            scheduling_id: "sched-1".into(),
            correlation_id: "corr-1".into(),
            install_crd: false,
        }
    }

    #[test]
    fn request_serializes_with_wire_names() {
        let component = Component::new("istio", "istio-system").with_config("ha", json!(true));
        let request = params(component).to_request("http://mothership:8080/cb");
        let wire = serde_json::to_value(&request).expect("serialize");
        assert_eq!(wire["componentsReady"], json!(["CRDs"]));
        assert_eq!(wire["version"], json!("2.0.0"));
        assert_eq!(wire["profile"], json!("evaluation"));
        assert_eq!(wire["configuration"], json!([{"key": "ha", "value": true}]));
        assert_eq!(wire["callbackURL"], json!("http://mothership:8080/cb"));
        assert_eq!(wire["correlationID"], json!("corr-1"));
        assert_eq!(wire["action"], json!("reconcile"));
        request.validate(true).expect("valid");
    }

    #[test]
    fn version_prefers_component_then_git_branch() {
        let mut component = Component::new("custom", "default");
        component.url = Some("https://example.com/custom.git".into());
        assert_eq!(params(component.clone()).to_request("").version, "main");
        component.version = Some("1.4.2".into());
        assert_eq!(params(component).to_request("").version, "1.4.2");
    }

    #[test]
    fn delete_runs_are_flagged() {
        let mut p = params(Component::new("istio", "istio-system"));
        p.state = state_with(&["istio"], ClusterStatus::DeletePending);
        assert_eq!(p.to_request("cb").action, ReconciliationKind::Delete);
    }

    #[test]
    fn validation_names_missing_fields() {
        let mut request = params(Component::new("istio", "")).to_request("");
        request.kubeconfig.clear();
        let err = request.validate(true).expect_err("invalid");
        let msg = err.to_string();
        assert!(msg.contains("namespace"));
        assert!(msg.contains("kubeconfig"));
        assert!(msg.contains("callbackURL"));
        request.namespace = "ns".into();
        request.kubeconfig = "cfg".into();
        request.validate(false).expect("valid without callback");
    }

    #[test]
    fn callback_statuses_map_to_operation_states() {
        let registry = InMemoryOperationsRegistry::new();
        registry
            .register_operation(NewOperation {
                correlation_id: "corr-1",
                scheduling_id: "sched-1",
                component: "istio",
                runtime_id: "rt-1",
                config_version: 2,
            })
            .expect("register");
        let running = apply_callback(
            &registry,
            "corr-1",
            "sched-1",
            &CallbackMessage::new(ReconcilerStatus::Running),
        )
        .expect("running");
        assert_eq!(running.state, OperationState::InProgress);
        let failed = apply_callback(
            &registry,
            "corr-1",
            "sched-1",
            &CallbackMessage::with_error(ReconcilerStatus::Failed, "retrying"),
        )
        .expect("failed");
        assert_eq!(failed.state, OperationState::Failed);
        assert_eq!(failed.reason, "retrying");
        let done = apply_callback(
            &registry,
            "corr-1",
            "sched-1",
            &CallbackMessage::new(ReconcilerStatus::Success),
        )
        .expect("success");
        assert_eq!(done.state, OperationState::Done);
        assert_eq!("SUCCESS".parse::<ReconcilerStatus>(), Ok(ReconcilerStatus::Success));
        assert!("bogus".parse::<ReconcilerStatus>().is_err());
    }
}
