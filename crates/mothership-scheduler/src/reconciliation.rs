//! Persistent record of scheduling runs. At most one unfinished run exists per cluster.

use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};

use mothership_inventory::schema::TBL_RECONCILIATIONS;
use mothership_inventory::{Connection, Row, SqlValue, State};

use crate::error::SchedulerError;

#[derive(Clone, Debug, PartialEq)]
pub struct ReconciliationEntity {
    pub scheduling_id: String,
    pub runtime_id: String,
    pub cluster_version: i64,
    pub config_version: i64,
    /// Status row written when the run finished, `0` while running.
    pub status_id: i64,
    pub finished: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

pub trait ReconciliationRepository {
    /// Records a new run for the cluster of `state`. Fails with
    /// [`SchedulerError::DuplicateReconciliation`] while another run is unfinished.
    fn create_reconciliation(&self, state: &State) -> Result<ReconciliationEntity, SchedulerError>;

    fn get_reconciliation(&self, scheduling_id: &str)
        -> Result<ReconciliationEntity, SchedulerError>;

    fn get_reconciliations(
        &self,
        active_only: bool,
    ) -> Result<Vec<ReconciliationEntity>, SchedulerError>;

    fn finish_reconciliation(&self, scheduling_id: &str, status_id: i64)
        -> Result<(), SchedulerError>;

    fn remove_reconciliation(&self, scheduling_id: &str) -> Result<(), SchedulerError>;

    fn with_tx<'t>(&self, tx: &'t dyn Connection) -> Box<dyn ReconciliationRepository + 't>;
}

pub type SharedReconciliationRepository = Arc<dyn ReconciliationRepository + Send + Sync>;

pub struct SqlReconciliationRepository<C> {
    conn: C,
}

pub type DefaultReconciliationRepository =
    SqlReconciliationRepository<Arc<dyn Connection + Send + Sync>>;

impl DefaultReconciliationRepository {
    /// Expects the schema to be migrated, as done by `DefaultInventory::new`.
    pub fn new(conn: Arc<dyn Connection + Send + Sync>) -> Self {
        Self { conn }
    }
}

fn entity_from_row(row: &Row) -> Result<ReconciliationEntity, SchedulerError> {
    Ok(ReconciliationEntity {
        scheduling_id: row.get_string("scheduling_id")?,
        runtime_id: row.get_string("runtime_id")?,
        cluster_version: row.get_i64("cluster_version")?,
        config_version: row.get_i64("config_version")?,
        status_id: row.get_i64("status_id")?,
        finished: row.get_bool("finished")?,
        created: row.get_timestamp("created")?,
        updated: row.get_timestamp("updated")?,
    })
}

impl<C> ReconciliationRepository for SqlReconciliationRepository<C>
where
    C: Deref,
    C::Target: Connection,
{
    fn create_reconciliation(&self, state: &State) -> Result<ReconciliationEntity, SchedulerError> {
        let active = format!(
            "SELECT * FROM {TBL_RECONCILIATIONS} WHERE runtime_id = $1 AND finished = $2 LIMIT 1"
        );
        if let Some(row) = self
            .conn
            .query_one(&active, &[state.runtime_id().into(), false.into()])?
        {
            return Err(SchedulerError::DuplicateReconciliation {
                runtime_id: state.runtime_id().to_string(),
                scheduling_id: row.get_string("scheduling_id")?,
            });
        }

        let now = Utc::now().trunc_subsecs(3);
        let entity = ReconciliationEntity {
            scheduling_id: uuid::Uuid::new_v4().to_string(),
            runtime_id: state.runtime_id().to_string(),
            cluster_version: state.cluster.version,
            config_version: state.configuration.version,
            status_id: 0,
            finished: false,
            created: now,
            updated: now,
        };
        let insert = format!(
            "INSERT INTO {TBL_RECONCILIATIONS}
             (scheduling_id, runtime_id, cluster_version, config_version, status_id, finished, created, updated)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        );
        self.conn.execute(
            &insert,
            &[
                entity.scheduling_id.as_str().into(),
                entity.runtime_id.as_str().into(),
                entity.cluster_version.into(),
                entity.config_version.into(),
                entity.status_id.into(),
                entity.finished.into(),
                entity.created.into(),
                entity.updated.into(),
            ],
        )?;
        log::debug!(
            "reconciliation_created runtime_id={} scheduling_id={}",
            entity.runtime_id,
            entity.scheduling_id
        );
        Ok(entity)
    }

    fn get_reconciliation(
        &self,
        scheduling_id: &str,
    ) -> Result<ReconciliationEntity, SchedulerError> {
        let sql = format!("SELECT * FROM {TBL_RECONCILIATIONS} WHERE scheduling_id = $1");
        match self.conn.query_one(&sql, &[scheduling_id.into()])? {
            Some(row) => entity_from_row(&row),
            None => Err(SchedulerError::ReconciliationNotFound(
                scheduling_id.to_string(),
            )),
        }
    }

    fn get_reconciliations(
        &self,
        active_only: bool,
    ) -> Result<Vec<ReconciliationEntity>, SchedulerError> {
        let rows = if active_only {
            self.conn.query(
                &format!(
                    "SELECT * FROM {TBL_RECONCILIATIONS} WHERE finished = $1 ORDER BY created"
                ),
                &[false.into()],
            )?
        } else {
            self.conn.query(
                &format!("SELECT * FROM {TBL_RECONCILIATIONS} ORDER BY created"),
                &[],
            )?
        };
        rows.iter().map(entity_from_row).collect()
    }

    fn finish_reconciliation(
        &self,
        scheduling_id: &str,
        status_id: i64,
    ) -> Result<(), SchedulerError> {
        let sql = format!(
            "UPDATE {TBL_RECONCILIATIONS} SET finished = $1, status_id = $2, updated = $3
             WHERE scheduling_id = $4"
        );
        let updated = self.conn.execute(
            &sql,
            &[
                true.into(),
                status_id.into(),
                SqlValue::from(Utc::now().trunc_subsecs(3)),
                scheduling_id.into(),
            ],
        )?;
        if updated == 0 {
            return Err(SchedulerError::ReconciliationNotFound(
                scheduling_id.to_string(),
            ));
        }
        Ok(())
    }

    fn remove_reconciliation(&self, scheduling_id: &str) -> Result<(), SchedulerError> {
        let sql = format!("DELETE FROM {TBL_RECONCILIATIONS} WHERE scheduling_id = $1");
        self.conn.execute(&sql, &[scheduling_id.into()])?;
        Ok(())
    }

    fn with_tx<'t>(&self, tx: &'t dyn Connection) -> Box<dyn ReconciliationRepository + 't> {
        Box::new(SqlReconciliationRepository { conn: tx })
    }
}

#[cfg(all(test, feature = "sqlite-persistence"))]
mod tests {
    use super::*;
    use crate::invoker::testing::state_with;
    use mothership_inventory::{schema, ClusterStatus, SqliteConnection};

    fn repository() -> DefaultReconciliationRepository {
        let conn: Arc<dyn Connection + Send + Sync> =
            Arc::new(SqliteConnection::open_in_memory().expect("open sqlite"));
        schema::migrate(&*conn).expect("migrate");
        DefaultReconciliationRepository::new(conn)
    }

    #[test]
    fn second_active_run_is_rejected() {
        let repo = repository();
        let state = state_with(&["istio"], ClusterStatus::ReconcilePending);
        let first = repo.create_reconciliation(&state).expect("create");
        assert!(!first.finished);

        let err = repo
            .create_reconciliation(&state)
            .expect_err("duplicate");
        assert!(matches!(
            err,
            SchedulerError::DuplicateReconciliation { ref scheduling_id, .. }
                if *scheduling_id == first.scheduling_id
        ));

        repo.finish_reconciliation(&first.scheduling_id, 7)
            .expect("finish");
        let finished = repo
            .get_reconciliation(&first.scheduling_id)
            .expect("get");
        assert!(finished.finished);
        assert_eq!(finished.status_id, 7);
        repo.create_reconciliation(&state)
            .expect("new run after finish");
    }

    #[test]
    fn listing_filters_active_runs() {
        let repo = repository();
        let state = state_with(&["istio"], ClusterStatus::ReconcilePending);
        let done = repo.create_reconciliation(&state).expect("create");
        repo.finish_reconciliation(&done.scheduling_id, 1)
            .expect("finish");
        let active = repo.create_reconciliation(&state).expect("create");

        let all = repo.get_reconciliations(false).expect("all");
        assert_eq!(all.len(), 2);
        let running = repo.get_reconciliations(true).expect("active");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].scheduling_id, active.scheduling_id);
    }

    #[test]
    fn unknown_runs_are_not_found() {
        let repo = repository();
        assert!(matches!(
            repo.get_reconciliation("missing"),
            Err(SchedulerError::ReconciliationNotFound(_))
        ));
        assert!(matches!(
            repo.finish_reconciliation("missing", 1),
            Err(SchedulerError::ReconciliationNotFound(_))
        ));
        repo.remove_reconciliation("missing")
            .expect("remove is idempotent");
    }
}
