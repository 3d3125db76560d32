//! Dialect-aware selection predicates over the status history table.
//!
//! A filter renders a SQL boolean expression for one storage dialect. Field names are logical
//! (`Status`, `Created`, ...) and are mapped to columns through a [`ColumnResolver`], so the
//! same filter works against any table layout that exposes those fields.

use std::time::Duration;

use crate::db::Dialect;
use crate::error::InventoryError;
use crate::model::ClusterStatus;

/// Maps logical field names to column names.
pub trait ColumnResolver {
    fn column_name(&self, field: &str) -> Result<String, InventoryError>;
}

/// Static field/column table of one relation.
pub struct ColumnMap {
    columns: &'static [(&'static str, &'static str)],
    alias: Option<&'static str>,
}

impl ColumnMap {
    pub const fn new(columns: &'static [(&'static str, &'static str)]) -> Self {
        Self {
            columns,
            alias: None,
        }
    }

    /// Prefixes every resolved column with a table alias.
    pub const fn aliased(mut self, alias: &'static str) -> Self {
        self.alias = Some(alias);
        self
    }
}

impl ColumnResolver for ColumnMap {
    fn column_name(&self, field: &str) -> Result<String, InventoryError> {
        let column = self
            .columns
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, column)| *column)
            .ok_or_else(|| InventoryError::Filter(format!("unknown field '{}'", field)))?;
        Ok(match self.alias {
            Some(alias) => format!("{}.{}", alias, column),
            None => column.to_string(),
        })
    }
}

/// Columns of the status history relation.
pub const STATUS_COLUMNS: ColumnMap = ColumnMap::new(&[
    ("ID", "id"),
    ("RuntimeID", "runtime_id"),
    ("ClusterVersion", "cluster_version"),
    ("ConfigVersion", "config_version"),
    ("Status", "status"),
    ("Created", "created"),
]);

pub trait StatusSqlFilter: Send + Sync {
    fn filter(&self, dialect: Dialect, columns: &dyn ColumnResolver)
        -> Result<String, InventoryError>;
}

/// Statuses a cluster may sit in while waiting for its next periodic check.
const RECHECK_STATUSES: [ClusterStatus; 3] = [
    ClusterStatus::Ready,
    ClusterStatus::ReconcileErrorRetryable,
    ClusterStatus::DeleteErrorRetryable,
];

/// Matches statuses in a given set.
#[derive(Clone, Debug)]
pub struct StatusFilter {
    pub allowed: Vec<ClusterStatus>,
}

impl StatusFilter {
    pub fn new(allowed: impl IntoIterator<Item = ClusterStatus>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl StatusSqlFilter for StatusFilter {
    fn filter(
        &self,
        _dialect: Dialect,
        columns: &dyn ColumnResolver,
    ) -> Result<String, InventoryError> {
        status_in(&self.allowed, columns)
    }
}

/// Matches clusters that concluded a run at least `interval` ago.
#[derive(Clone, Debug)]
pub struct ReconcileIntervalFilter {
    pub interval: Duration,
}

impl StatusSqlFilter for ReconcileIntervalFilter {
    fn filter(
        &self,
        dialect: Dialect,
        columns: &dyn ColumnResolver,
    ) -> Result<String, InventoryError> {
        let statuses = status_in(&RECHECK_STATUSES, columns)?;
        let created = columns.column_name("Created")?;
        Ok(format!(
            "{} AND {} <= {}",
            statuses,
            created,
            now_minus(dialect, self.interval)
        ))
    }
}

/// Matches one runtime's status rows created within the last `interval`.
#[derive(Clone, Debug)]
pub struct CreatedIntervalFilter {
    pub runtime_id: String,
    pub interval: Duration,
}

impl StatusSqlFilter for CreatedIntervalFilter {
    fn filter(
        &self,
        dialect: Dialect,
        columns: &dyn ColumnResolver,
    ) -> Result<String, InventoryError> {
        let runtime = columns.column_name("RuntimeID")?;
        let created = columns.column_name("Created")?;
        Ok(format!(
            "{} = {} AND {} >= {}",
            runtime,
            quote_literal(&self.runtime_id),
            created,
            now_minus(dialect, self.interval)
        ))
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeIdFilter {
    pub runtime_id: String,
}

impl StatusSqlFilter for RuntimeIdFilter {
    fn filter(
        &self,
        _dialect: Dialect,
        columns: &dyn ColumnResolver,
    ) -> Result<String, InventoryError> {
        Ok(format!(
            "{} = {}",
            columns.column_name("RuntimeID")?,
            quote_literal(&self.runtime_id)
        ))
    }
}

/// ORs all filters together. No filters means no restriction.
pub fn combine_or(
    filters: &[&dyn StatusSqlFilter],
    dialect: Dialect,
    columns: &dyn ColumnResolver,
) -> Result<String, InventoryError> {
    if filters.is_empty() {
        return Ok("1=1".to_string());
    }
    let parts = filters
        .iter()
        .map(|f| f.filter(dialect, columns).map(|sql| format!("({})", sql)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(" OR "))
}

fn status_in(
    statuses: &[ClusterStatus],
    columns: &dyn ColumnResolver,
) -> Result<String, InventoryError> {
    if statuses.is_empty() {
        return Err(InventoryError::Filter("status filter without statuses".into()));
    }
    let list = statuses
        .iter()
        .map(|s| quote_literal(s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("{} IN ({})", columns.column_name("Status")?, list))
}

fn now_minus(dialect: Dialect, interval: Duration) -> String {
    let secs = interval.as_secs();
    match dialect {
        Dialect::Postgres => format!("NOW() - INTERVAL '{} SECOND'", secs),
        Dialect::Sqlite => format!("DATETIME('now', '-{} SECONDS')", secs),
    }
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
