//! Versioned cluster inventory.
//!
//! Clusters, configurations and statuses are append-only: a change is a new row with a higher
//! version (or id), never an update in place. The latest state of a cluster is its newest
//! configuration together with the newest status recorded for that configuration.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};

use crate::db::{self, Connection, Row, SqlValue};
use crate::error::{map_json_err, InventoryError};
use crate::filter::{
    combine_or, ReconcileIntervalFilter, CreatedIntervalFilter, StatusFilter, StatusSqlFilter,
    STATUS_COLUMNS,
};
use crate::model::{
    ClusterEntity, ClusterSpec, ClusterStatus, ConfigurationEntity, State, StatusChange,
    StatusEntity,
};
use crate::schema::{self, TBL_CLUSTERS, TBL_CONFIGURATIONS, TBL_STATUSES};

/// Statuses reported by [`Inventory::clusters_not_ready`].
pub const NOT_READY_STATUSES: [ClusterStatus; 4] = [
    ClusterStatus::Reconciling,
    ClusterStatus::ReconcileError,
    ClusterStatus::Deleting,
    ClusterStatus::DeleteError,
];

/// Statuses picked up by [`Inventory::clusters_to_reconcile`] regardless of their age.
pub const PENDING_STATUSES: [ClusterStatus; 2] =
    [ClusterStatus::ReconcilePending, ClusterStatus::DeletePending];

/// Query and write surface of the cluster inventory.
///
/// Every write is atomic on its own. To compose several calls atomically, open a transaction
/// on the connection and use the inventory returned by [`Inventory::with_tx`].
pub trait Inventory {
    /// Stores a new cluster/configuration version when `spec` differs from the latest one and
    /// marks it `ReconcilePending`. Identical content returns the current state unchanged.
    fn create_or_update(&self, contract: i64, spec: &ClusterSpec) -> Result<State, InventoryError>;

    fn get_latest(&self, runtime_id: &str) -> Result<State, InventoryError>;

    /// State of a specific configuration version.
    fn get(&self, runtime_id: &str, config_version: i64) -> Result<State, InventoryError>;

    fn get_all(&self) -> Result<Vec<State>, InventoryError>;

    /// Appends `status` for the configuration of `state` unless it already is the latest status.
    fn update_status(&self, state: &State, status: ClusterStatus) -> Result<State, InventoryError>;

    fn mark_for_deletion(&self, runtime_id: &str) -> Result<State, InventoryError>;

    /// Removes every cluster, configuration and status row of the runtime.
    fn delete(&self, runtime_id: &str) -> Result<(), InventoryError>;

    /// Pending clusters, plus clusters that concluded their last run at least
    /// `reconcile_interval` ago. A zero interval disables the periodic re-check.
    fn clusters_to_reconcile(
        &self,
        reconcile_interval: Duration,
    ) -> Result<Vec<State>, InventoryError>;

    fn clusters_not_ready(&self) -> Result<Vec<State>, InventoryError>;

    /// Status history within `window`, newest first, with the time spent in each status.
    fn status_changes(
        &self,
        runtime_id: &str,
        window: Duration,
    ) -> Result<Vec<StatusChange>, InventoryError>;

    /// Counts `error_statuses` among the last `max_scan` statuses of a configuration, stopping
    /// at the most recent `Ready`.
    fn count_retries(
        &self,
        runtime_id: &str,
        config_version: i64,
        max_scan: usize,
        error_statuses: &[ClusterStatus],
    ) -> Result<usize, InventoryError>;

    /// Removes statuses created more than `age` ago. The latest status of every configuration
    /// is always kept. Returns the number of removed rows.
    fn remove_statuses_older_than(&self, age: Duration) -> Result<u64, InventoryError>;

    /// Inventory bound to an open transaction.
    fn with_tx<'t>(&self, tx: &'t dyn Connection) -> Box<dyn Inventory + 't>;
}

pub type SharedInventory = Arc<dyn Inventory + Send + Sync>;

/// SQL implementation of [`Inventory`] over any [`Connection`].
pub struct SqlInventory<C> {
    conn: C,
}

/// Inventory owning a shared connection.
pub type DefaultInventory = SqlInventory<Arc<dyn Connection + Send + Sync>>;

impl DefaultInventory {
    /// Wraps the connection and creates missing tables.
    pub fn new(conn: Arc<dyn Connection + Send + Sync>) -> Result<Self, InventoryError> {
        schema::migrate(&*conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> Arc<dyn Connection + Send + Sync> {
        self.conn.clone()
    }
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<String, InventoryError> {
    serde_json::to_string(value).map_err(|e| map_json_err(what, e))
}

fn from_json<T: serde::de::DeserializeOwned>(what: &str, raw: &str) -> Result<T, InventoryError> {
    serde_json::from_str(raw).map_err(|e| map_json_err(what, e))
}

fn cluster_from_row(row: &Row) -> Result<ClusterEntity, InventoryError> {
    Ok(ClusterEntity {
        version: row.get_i64("version")?,
        runtime_id: row.get_string("runtime_id")?,
        runtime: from_json("decode runtime", &row.get_string("runtime")?)?,
        metadata: from_json("decode metadata", &row.get_string("metadata")?)?,
        kubeconfig: row.get_string("kubeconfig")?,
        contract: row.get_i64("contract")?,
        created: row.get_timestamp("created")?,
    })
}

fn configuration_from_row(row: &Row) -> Result<ConfigurationEntity, InventoryError> {
    Ok(ConfigurationEntity {
        version: row.get_i64("version")?,
        runtime_id: row.get_string("runtime_id")?,
        cluster_version: row.get_i64("cluster_version")?,
        kyma_version: row.get_string("kyma_version")?,
        kyma_profile: row.get_string("kyma_profile")?,
        components: from_json("decode components", &row.get_string("components")?)?,
        administrators: from_json("decode administrators", &row.get_string("administrators")?)?,
        contract: row.get_i64("contract")?,
        created: row.get_timestamp("created")?,
    })
}

fn status_from_row(row: &Row) -> Result<StatusEntity, InventoryError> {
    Ok(StatusEntity {
        id: row.get_i64("id")?,
        runtime_id: row.get_string("runtime_id")?,
        cluster_version: row.get_i64("cluster_version")?,
        config_version: row.get_i64("config_version")?,
        status: row.get_string("status")?.parse()?,
        created: row.get_timestamp("created")?,
    })
}

fn validate_spec(spec: &ClusterSpec) -> Result<(), InventoryError> {
    if spec.runtime_id.trim().is_empty() {
        return Err(InventoryError::Invalid("runtime id must not be empty".into()));
    }
    if spec.kyma_config.components.is_empty() {
        return Err(InventoryError::Invalid(format!(
            "cluster '{}' has no components",
            spec.runtime_id
        )));
    }
    Ok(())
}

impl<C> SqlInventory<C>
where
    C: Deref,
    C::Target: Connection,
{
    fn latest_cluster(&self, runtime_id: &str) -> Result<Option<ClusterEntity>, InventoryError> {
        let sql = format!(
            "SELECT * FROM {TBL_CLUSTERS} WHERE runtime_id = $1 ORDER BY version DESC LIMIT 1"
        );
        self.conn
            .query_one(&sql, &[runtime_id.into()])?
            .map(|row| cluster_from_row(&row))
            .transpose()
    }

    fn cluster(&self, runtime_id: &str, version: i64) -> Result<ClusterEntity, InventoryError> {
        let sql = format!("SELECT * FROM {TBL_CLUSTERS} WHERE runtime_id = $1 AND version = $2");
        match self.conn.query_one(&sql, &[runtime_id.into(), version.into()])? {
            Some(row) => cluster_from_row(&row),
            None => Err(InventoryError::NotFound(format!(
                "cluster '{}' version {}",
                runtime_id, version
            ))),
        }
    }

    fn latest_configuration(
        &self,
        runtime_id: &str,
        cluster_version: i64,
    ) -> Result<Option<ConfigurationEntity>, InventoryError> {
        let sql = format!(
            "SELECT * FROM {TBL_CONFIGURATIONS} WHERE runtime_id = $1 AND cluster_version = $2 ORDER BY version DESC LIMIT 1"
        );
        self.conn
            .query_one(&sql, &[runtime_id.into(), cluster_version.into()])?
            .map(|row| configuration_from_row(&row))
            .transpose()
    }

    fn configuration(
        &self,
        runtime_id: &str,
        version: i64,
    ) -> Result<ConfigurationEntity, InventoryError> {
        let sql =
            format!("SELECT * FROM {TBL_CONFIGURATIONS} WHERE runtime_id = $1 AND version = $2");
        match self.conn.query_one(&sql, &[runtime_id.into(), version.into()])? {
            Some(row) => configuration_from_row(&row),
            None => Err(InventoryError::NotFound(format!(
                "configuration '{}' version {}",
                runtime_id, version
            ))),
        }
    }

    fn latest_status(
        &self,
        runtime_id: &str,
        config_version: i64,
    ) -> Result<Option<StatusEntity>, InventoryError> {
        let sql = format!(
            "SELECT * FROM {TBL_STATUSES} WHERE runtime_id = $1 AND config_version = $2 ORDER BY id DESC LIMIT 1"
        );
        self.conn
            .query_one(&sql, &[runtime_id.into(), config_version.into()])?
            .map(|row| status_from_row(&row))
            .transpose()
    }

    fn insert_cluster(
        &self,
        contract: i64,
        spec: &ClusterSpec,
    ) -> Result<ClusterEntity, InventoryError> {
        let created = now();
        let sql = format!(
            "INSERT INTO {TBL_CLUSTERS} (runtime_id, runtime, metadata, kubeconfig, contract, created)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING version"
        );
        let row = self
            .conn
            .query_one(
                &sql,
                &[
                    spec.runtime_id.as_str().into(),
                    to_json("encode runtime", &spec.runtime_input)?.into(),
                    to_json("encode metadata", &spec.metadata)?.into(),
                    spec.kubeconfig.as_str().into(),
                    contract.into(),
                    created.into(),
                ],
            )?
            .ok_or_else(|| InventoryError::Invalid("insert cluster returned no row".into()))?;
        Ok(ClusterEntity {
            version: row.get_i64("version")?,
            runtime_id: spec.runtime_id.clone(),
            runtime: spec.runtime_input.clone(),
            metadata: spec.metadata.clone(),
            kubeconfig: spec.kubeconfig.clone(),
            contract,
            created,
        })
    }

    fn insert_configuration(
        &self,
        candidate: ConfigurationEntity,
    ) -> Result<ConfigurationEntity, InventoryError> {
        let sql = format!(
            "INSERT INTO {TBL_CONFIGURATIONS}
             (runtime_id, cluster_version, kyma_version, kyma_profile, components, administrators, contract, created)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING version"
        );
        let row = self
            .conn
            .query_one(
                &sql,
                &[
                    candidate.runtime_id.as_str().into(),
                    candidate.cluster_version.into(),
                    candidate.kyma_version.as_str().into(),
                    candidate.kyma_profile.as_str().into(),
                    to_json("encode components", &candidate.components)?.into(),
                    to_json("encode administrators", &candidate.administrators)?.into(),
                    candidate.contract.into(),
                    candidate.created.into(),
                ],
            )?
            .ok_or_else(|| InventoryError::Invalid("insert configuration returned no row".into()))?;
        Ok(ConfigurationEntity {
            version: row.get_i64("version")?,
            ..candidate
        })
    }

    fn insert_status(
        &self,
        cluster: &ClusterEntity,
        configuration: &ConfigurationEntity,
        status: ClusterStatus,
    ) -> Result<StatusEntity, InventoryError> {
        let created = now();
        let sql = format!(
            "INSERT INTO {TBL_STATUSES} (runtime_id, cluster_version, config_version, status, created)
             VALUES ($1, $2, $3, $4, $5) RETURNING id"
        );
        let row = self
            .conn
            .query_one(
                &sql,
                &[
                    cluster.runtime_id.as_str().into(),
                    cluster.version.into(),
                    configuration.version.into(),
                    status.as_str().into(),
                    created.into(),
                ],
            )?
            .ok_or_else(|| InventoryError::Invalid("insert status returned no row".into()))?;
        let id = row.get_i64("id")?;
        log::debug!(
            "inventory_status_added runtime_id={} config_version={} status={} id={}",
            cluster.runtime_id,
            configuration.version,
            status,
            id
        );
        Ok(StatusEntity {
            id,
            runtime_id: cluster.runtime_id.clone(),
            cluster_version: cluster.version,
            config_version: configuration.version,
            status,
            created,
        })
    }

    fn write_cluster_spec(&self, contract: i64, spec: &ClusterSpec) -> Result<State, InventoryError> {
        let candidate_cluster = ClusterEntity {
            version: 0,
            runtime_id: spec.runtime_id.clone(),
            runtime: spec.runtime_input.clone(),
            metadata: spec.metadata.clone(),
            kubeconfig: spec.kubeconfig.clone(),
            contract,
            created: now(),
        };
        let cluster = match self.latest_cluster(&spec.runtime_id)? {
            Some(existing) if existing.same_content(&candidate_cluster) => existing,
            _ => self.insert_cluster(contract, spec)?,
        };

        let candidate_config = ConfigurationEntity {
            version: 0,
            runtime_id: spec.runtime_id.clone(),
            cluster_version: cluster.version,
            kyma_version: spec.kyma_config.version.clone(),
            kyma_profile: spec.kyma_config.profile.clone(),
            components: spec.kyma_config.components.clone(),
            administrators: spec.kyma_config.administrators.clone(),
            contract,
            created: now(),
        };
        let (configuration, reused) =
            match self.latest_configuration(&spec.runtime_id, cluster.version)? {
                Some(existing) if existing.same_content(&candidate_config) => (existing, true),
                _ => (self.insert_configuration(candidate_config)?, false),
            };

        let status = match self.latest_status(&spec.runtime_id, configuration.version)? {
            Some(existing) if reused => existing,
            _ => self.insert_status(&cluster, &configuration, ClusterStatus::ReconcilePending)?,
        };
        if !reused {
            log::info!(
                "inventory_cluster_stored runtime_id={} cluster_version={} config_version={}",
                cluster.runtime_id,
                cluster.version,
                configuration.version
            );
        }
        Ok(State {
            cluster,
            configuration,
            status,
        })
    }

    fn state_for_status(&self, status: StatusEntity) -> Result<State, InventoryError> {
        let cluster = self.cluster(&status.runtime_id, status.cluster_version)?;
        let configuration = self.configuration(&status.runtime_id, status.config_version)?;
        Ok(State {
            cluster,
            configuration,
            status,
        })
    }

    /// Latest state of every cluster whose latest status matches any of `filters`.
    fn filter_latest(&self, filters: &[&dyn StatusSqlFilter]) -> Result<Vec<State>, InventoryError> {
        let predicate = combine_or(filters, self.conn.dialect(), &STATUS_COLUMNS.aliased("s"))?;
        let sql = format!(
            "SELECT s.* FROM {TBL_STATUSES} s
             WHERE s.id IN (
                 SELECT MAX(st.id) FROM {TBL_STATUSES} st
                 WHERE st.config_version = (
                     SELECT MAX(c.version) FROM {TBL_CONFIGURATIONS} c WHERE c.runtime_id = st.runtime_id
                 )
                 GROUP BY st.runtime_id
             )
             AND ({predicate})
             ORDER BY s.id"
        );
        self.conn
            .query(&sql, &[])?
            .iter()
            .map(|row| status_from_row(row).and_then(|s| self.state_for_status(s)))
            .collect()
    }
}

impl<C> Inventory for SqlInventory<C>
where
    C: Deref,
    C::Target: Connection,
{
    fn create_or_update(&self, contract: i64, spec: &ClusterSpec) -> Result<State, InventoryError> {
        validate_spec(spec)?;
        db::transaction(&*self.conn, |tx| {
            SqlInventory { conn: tx }.write_cluster_spec(contract, spec)
        })
    }

    fn get_latest(&self, runtime_id: &str) -> Result<State, InventoryError> {
        let not_found = || InventoryError::NotFound(format!("cluster '{}'", runtime_id));
        let cluster = self.latest_cluster(runtime_id)?.ok_or_else(not_found)?;
        let configuration = self
            .latest_configuration(runtime_id, cluster.version)?
            .ok_or_else(not_found)?;
        let status = self
            .latest_status(runtime_id, configuration.version)?
            .ok_or_else(not_found)?;
        Ok(State {
            cluster,
            configuration,
            status,
        })
    }

    fn get(&self, runtime_id: &str, config_version: i64) -> Result<State, InventoryError> {
        let configuration = self.configuration(runtime_id, config_version)?;
        let cluster = self.cluster(runtime_id, configuration.cluster_version)?;
        let status = self
            .latest_status(runtime_id, config_version)?
            .ok_or_else(|| {
                InventoryError::NotFound(format!(
                    "status of cluster '{}' config version {}",
                    runtime_id, config_version
                ))
            })?;
        Ok(State {
            cluster,
            configuration,
            status,
        })
    }

    fn get_all(&self) -> Result<Vec<State>, InventoryError> {
        self.filter_latest(&[])
    }

    fn update_status(&self, state: &State, status: ClusterStatus) -> Result<State, InventoryError> {
        db::transaction(&*self.conn, |tx| {
            let inv = SqlInventory { conn: tx };
            let current = inv.latest_status(state.runtime_id(), state.configuration.version)?;
            let status = match current {
                Some(current) if current.status == status => current,
                _ => inv.insert_status(&state.cluster, &state.configuration, status)?,
            };
            Ok(State {
                cluster: state.cluster.clone(),
                configuration: state.configuration.clone(),
                status,
            })
        })
    }

    fn mark_for_deletion(&self, runtime_id: &str) -> Result<State, InventoryError> {
        db::transaction(&*self.conn, |tx| {
            let inv = SqlInventory { conn: tx };
            let latest = inv.get_latest(runtime_id)?;
            inv.update_status(&latest, ClusterStatus::DeletePending)
        })
    }

    fn delete(&self, runtime_id: &str) -> Result<(), InventoryError> {
        db::transaction(&*self.conn, |tx| {
            for table in [TBL_STATUSES, TBL_CONFIGURATIONS, TBL_CLUSTERS] {
                tx.execute(
                    &format!("DELETE FROM {} WHERE runtime_id = $1", table),
                    &[runtime_id.into()],
                )?;
            }
            Ok::<_, InventoryError>(())
        })?;
        log::info!("inventory_cluster_deleted runtime_id={}", runtime_id);
        Ok(())
    }

    fn clusters_to_reconcile(
        &self,
        reconcile_interval: Duration,
    ) -> Result<Vec<State>, InventoryError> {
        let pending = StatusFilter::new(PENDING_STATUSES);
        let aged = ReconcileIntervalFilter {
            interval: reconcile_interval,
        };
        if reconcile_interval.is_zero() {
            self.filter_latest(&[&pending])
        } else {
            self.filter_latest(&[&pending, &aged])
        }
    }

    fn clusters_not_ready(&self) -> Result<Vec<State>, InventoryError> {
        self.filter_latest(&[&StatusFilter::new(NOT_READY_STATUSES)])
    }

    fn status_changes(
        &self,
        runtime_id: &str,
        window: Duration,
    ) -> Result<Vec<StatusChange>, InventoryError> {
        let predicate = CreatedIntervalFilter {
            runtime_id: runtime_id.to_string(),
            interval: window,
        }
        .filter(self.conn.dialect(), &STATUS_COLUMNS)?;
        let sql = format!("SELECT * FROM {TBL_STATUSES} WHERE {predicate} ORDER BY id DESC");
        let statuses = self
            .conn
            .query(&sql, &[])?
            .iter()
            .map(status_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if statuses.is_empty() {
            return Err(InventoryError::NotFound(format!(
                "no status changes for cluster '{}'",
                runtime_id
            )));
        }

        let mut changes = Vec::with_capacity(statuses.len());
        let mut until = Utc::now();
        for status in statuses {
            let duration = until - status.created;
            until = status.created;
            changes.push(StatusChange { status, duration });
        }
        Ok(changes)
    }

    fn count_retries(
        &self,
        runtime_id: &str,
        config_version: i64,
        max_scan: usize,
        error_statuses: &[ClusterStatus],
    ) -> Result<usize, InventoryError> {
        if error_statuses.is_empty() {
            return Err(InventoryError::Invalid(
                "count retries needs at least one error status".into(),
            ));
        }
        let sql = format!(
            "SELECT status FROM {TBL_STATUSES} WHERE runtime_id = $1 AND config_version = $2 ORDER BY id DESC LIMIT $3"
        );
        let rows = self.conn.query(
            &sql,
            &[
                runtime_id.into(),
                config_version.into(),
                SqlValue::Int(i64::try_from(max_scan).unwrap_or(i64::MAX)),
            ],
        )?;

        let mut retries = 0;
        for row in rows {
            let status: ClusterStatus = row.get_string("status")?.parse()?;
            if status == ClusterStatus::Ready {
                break;
            }
            if error_statuses.contains(&status) {
                retries += 1;
            }
        }
        Ok(retries)
    }

    fn remove_statuses_older_than(&self, age: Duration) -> Result<u64, InventoryError> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| InventoryError::Invalid(format!("status age: {}", e)))?;
        let sql = format!(
            "DELETE FROM {TBL_STATUSES}
             WHERE created < $1
             AND id NOT IN (
                 SELECT MAX(st.id) FROM {TBL_STATUSES} st GROUP BY st.runtime_id, st.config_version
             )"
        );
        let removed = self.conn.execute(&sql, &[(now() - age).into()])?;
        log::debug!(
            "inventory_statuses_purged removed={} age_secs={}",
            removed,
            age.num_seconds()
        );
        Ok(removed)
    }

    fn with_tx<'t>(&self, tx: &'t dyn Connection) -> Box<dyn Inventory + 't> {
        Box::new(SqlInventory { conn: tx })
    }
}
