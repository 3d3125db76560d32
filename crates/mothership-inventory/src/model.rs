//! Cluster, configuration and status entities of the inventory.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InventoryError;

/// Lifecycle status of a cluster, persisted as its string name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterStatus {
    ReconcilePending,
    Reconciling,
    Ready,
    ReconcileError,
    ReconcileErrorRetryable,
    ReconcileDisabled,
    DeletePending,
    Deleting,
    Deleted,
    DeleteError,
    DeleteErrorRetryable,
}

impl ClusterStatus {
    pub const ALL: [ClusterStatus; 11] = [
        Self::ReconcilePending,
        Self::Reconciling,
        Self::Ready,
        Self::ReconcileError,
        Self::ReconcileErrorRetryable,
        Self::ReconcileDisabled,
        Self::DeletePending,
        Self::Deleting,
        Self::Deleted,
        Self::DeleteError,
        Self::DeleteErrorRetryable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReconcilePending => "ReconcilePending",
            Self::Reconciling => "Reconciling",
            Self::Ready => "Ready",
            Self::ReconcileError => "ReconcileError",
            Self::ReconcileErrorRetryable => "ReconcileErrorRetryable",
            Self::ReconcileDisabled => "ReconcileDisabled",
            Self::DeletePending => "DeletePending",
            Self::Deleting => "Deleting",
            Self::Deleted => "Deleted",
            Self::DeleteError => "DeleteError",
            Self::DeleteErrorRetryable => "DeleteErrorRetryable",
        }
    }

    /// A run has concluded (successfully or not) in this status.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Ready
                | Self::ReconcileError
                | Self::ReconcileErrorRetryable
                | Self::ReconcileDisabled
                | Self::Deleted
                | Self::DeleteError
                | Self::DeleteErrorRetryable
        )
    }

    pub fn is_final_stable(&self) -> bool {
        matches!(self, Self::Ready | Self::Deleted | Self::ReconcileDisabled)
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::ReconcileDisabled)
    }

    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            Self::DeletePending
                | Self::Deleting
                | Self::Deleted
                | Self::DeleteError
                | Self::DeleteErrorRetryable
        )
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = InventoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| InventoryError::Invalid(format!("unknown cluster status '{}'", s)))
    }
}

/// Whether a run installs/updates a cluster or removes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationKind {
    Reconcile,
    Delete,
}

impl ReconciliationKind {
    pub fn for_status(status: ClusterStatus) -> Self {
        if status.is_deletion() {
            Self::Delete
        } else {
            Self::Reconcile
        }
    }

    pub fn running_status(&self) -> ClusterStatus {
        match self {
            Self::Reconcile => ClusterStatus::Reconciling,
            Self::Delete => ClusterStatus::Deleting,
        }
    }

    pub fn success_status(&self) -> ClusterStatus {
        match self {
            Self::Reconcile => ClusterStatus::Ready,
            Self::Delete => ClusterStatus::Deleted,
        }
    }

    pub fn error_status(&self, retryable: bool) -> ClusterStatus {
        match (self, retryable) {
            (Self::Reconcile, true) => ClusterStatus::ReconcileErrorRetryable,
            (Self::Reconcile, false) => ClusterStatus::ReconcileError,
            (Self::Delete, true) => ClusterStatus::DeleteErrorRetryable,
            (Self::Delete, false) => ClusterStatus::DeleteError,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub secret: bool,
}

/// One independently reconcilable unit of a cluster configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub component: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub configuration: Vec<ConfigEntry>,
}

impl Component {
    pub fn new(component: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            namespace: namespace.into(),
            url: None,
            version: None,
            configuration: Vec::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.configuration.push(ConfigEntry {
            key: key.into(),
            value,
            secret: false,
        });
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KymaConfig {
    pub version: String,
    pub profile: String,
    pub components: Vec<Component>,
    #[serde(default)]
    pub administrators: Vec<String>,
}

/// Desired state submitted for one cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub runtime_id: String,
    #[serde(default)]
    pub runtime_input: RuntimeInput,
    #[serde(default)]
    pub metadata: Value,
    pub kubeconfig: String,
    pub kyma_config: KymaConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClusterEntity {
    pub version: i64,
    pub runtime_id: String,
    pub runtime: RuntimeInput,
    pub metadata: Value,
    pub kubeconfig: String,
    pub contract: i64,
    pub created: DateTime<Utc>,
}

impl ClusterEntity {
    /// Equal descriptor and credential; storage-assigned fields are ignored.
    pub fn same_content(&self, other: &ClusterEntity) -> bool {
        self.runtime_id == other.runtime_id
            && self.runtime == other.runtime
            && self.metadata == other.metadata
            && self.kubeconfig == other.kubeconfig
            && self.contract == other.contract
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConfigurationEntity {
    pub version: i64,
    pub runtime_id: String,
    pub cluster_version: i64,
    pub kyma_version: String,
    pub kyma_profile: String,
    pub components: Vec<Component>,
    pub administrators: Vec<String>,
    pub contract: i64,
    pub created: DateTime<Utc>,
}

impl ConfigurationEntity {
    pub fn same_content(&self, other: &ConfigurationEntity) -> bool {
        self.runtime_id == other.runtime_id
            && self.cluster_version == other.cluster_version
            && self.kyma_version == other.kyma_version
            && self.kyma_profile == other.kyma_profile
            && self.components == other.components
            && self.administrators == other.administrators
            && self.contract == other.contract
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components.iter().map(|c| c.component.clone()).collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusEntity {
    pub id: i64,
    pub runtime_id: String,
    pub cluster_version: i64,
    pub config_version: i64,
    pub status: ClusterStatus,
    pub created: DateTime<Utc>,
}

/// The configuration in force for a cluster together with its current status.
#[derive(Clone, Debug, PartialEq)]
pub struct State {
    pub cluster: ClusterEntity,
    pub configuration: ConfigurationEntity,
    pub status: StatusEntity,
}

impl State {
    pub fn runtime_id(&self) -> &str {
        &self.cluster.runtime_id
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusChange {
    pub status: StatusEntity,
    pub duration: Duration,
}
