//! Table definitions for the inventory and the scheduler's reconciliation records.

use crate::db::{Connection, Dialect};
use crate::error::StoreError;

pub const TBL_CLUSTERS: &str = "inventory_clusters";
pub const TBL_CONFIGURATIONS: &str = "inventory_cluster_configs";
pub const TBL_STATUSES: &str = "inventory_cluster_config_statuses";
pub const TBL_RECONCILIATIONS: &str = "scheduler_reconciliations";

struct Types {
    serial: &'static str,
    timestamp: &'static str,
    boolean: &'static str,
}

fn types(dialect: Dialect) -> Types {
    match dialect {
        Dialect::Sqlite => Types {
            serial: "INTEGER PRIMARY KEY AUTOINCREMENT",
            timestamp: "TEXT",
            boolean: "INTEGER",
        },
        Dialect::Postgres => Types {
            serial: "BIGSERIAL PRIMARY KEY",
            timestamp: "TIMESTAMPTZ",
            boolean: "BOOLEAN",
        },
    }
}

fn statements(dialect: Dialect) -> Vec<String> {
    let t = types(dialect);
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {TBL_CLUSTERS} (
                version {serial},
                runtime_id TEXT NOT NULL,
                runtime TEXT NOT NULL,
                metadata TEXT NOT NULL,
                kubeconfig TEXT NOT NULL,
                contract BIGINT NOT NULL,
                created {ts} NOT NULL
            )",
            serial = t.serial,
            ts = t.timestamp
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{TBL_CLUSTERS}_runtime ON {TBL_CLUSTERS} (runtime_id, version)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {TBL_CONFIGURATIONS} (
                version {serial},
                runtime_id TEXT NOT NULL,
                cluster_version BIGINT NOT NULL,
                kyma_version TEXT NOT NULL,
                kyma_profile TEXT NOT NULL,
                components TEXT NOT NULL,
                administrators TEXT NOT NULL,
                contract BIGINT NOT NULL,
                created {ts} NOT NULL
            )",
            serial = t.serial,
            ts = t.timestamp
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{TBL_CONFIGURATIONS}_runtime ON {TBL_CONFIGURATIONS} (runtime_id, version)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {TBL_STATUSES} (
                id {serial},
                runtime_id TEXT NOT NULL,
                cluster_version BIGINT NOT NULL,
                config_version BIGINT NOT NULL,
                status TEXT NOT NULL,
                created {ts} NOT NULL
            )",
            serial = t.serial,
            ts = t.timestamp
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{TBL_STATUSES}_runtime ON {TBL_STATUSES} (runtime_id, config_version, id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {TBL_RECONCILIATIONS} (
                scheduling_id TEXT PRIMARY KEY,
                runtime_id TEXT NOT NULL,
                cluster_version BIGINT NOT NULL,
                config_version BIGINT NOT NULL,
                status_id BIGINT NOT NULL DEFAULT 0,
                finished {boolean} NOT NULL DEFAULT {no},
                created {ts} NOT NULL,
                updated {ts} NOT NULL
            )",
            boolean = t.boolean,
            no = if dialect == Dialect::Sqlite { "0" } else { "FALSE" },
            ts = t.timestamp
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{TBL_RECONCILIATIONS}_runtime ON {TBL_RECONCILIATIONS} (runtime_id, finished)"
        ),
    ]
}

/// Creates all tables and indices if they do not exist yet.
pub fn migrate(conn: &dyn Connection) -> Result<(), StoreError> {
    for sql in statements(conn.dialect()) {
        conn.execute(&sql, &[])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_uses_dialect_specific_keys() {
        let sqlite = statements(Dialect::Sqlite).join("\n");
        let postgres = statements(Dialect::Postgres).join("\n");
        assert!(sqlite.contains("AUTOINCREMENT"));
        assert!(!sqlite.contains("BIGSERIAL"));
        assert!(postgres.contains("BIGSERIAL PRIMARY KEY"));
        assert!(postgres.contains("TIMESTAMPTZ"));
        assert!(postgres.contains("DEFAULT FALSE"));
    }
}
