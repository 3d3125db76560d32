//! Versioned cluster inventory for the mothership reconciler.
//!
//! Stores every submitted cluster descriptor and configuration as a new version and keeps an
//! append-only status history per configuration. Selection queries are rendered per storage
//! dialect through [`filter`].

pub mod db;
pub mod error;
pub mod filter;
pub mod inventory;
pub mod model;
pub mod schema;

pub use db::{transaction, Connection, Dialect, Row, SqlValue, Transaction};
#[cfg(feature = "kernel-postgres")]
pub use db::PostgresConnection;
#[cfg(feature = "sqlite-persistence")]
pub use db::SqliteConnection;
pub use error::{InventoryError, StoreError};
pub use filter::{
    ColumnResolver, CreatedIntervalFilter, ReconcileIntervalFilter, RuntimeIdFilter,
    StatusFilter, StatusSqlFilter,
};
pub use inventory::{
    DefaultInventory, Inventory, SharedInventory, SqlInventory, NOT_READY_STATUSES,
    PENDING_STATUSES,
};
pub use model::{
    ClusterEntity, ClusterSpec, ClusterStatus, Component, ConfigEntry, ConfigurationEntity,
    KymaConfig, ReconciliationKind, RuntimeInput, State, StatusChange, StatusEntity,
};
