//! Error types for the storage layer and the inventory.

/// Errors raised by a storage driver or by row decoding.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Driver error: {0}")]
    Driver(String),
    #[error("Column error: {0}")]
    Column(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
}

/// Inventory-level error type.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("Filter error: {0}")]
    Filter(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl InventoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub(crate) fn map_driver_err(prefix: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Driver(format!("{prefix}: {err}"))
}

pub(crate) fn map_json_err(prefix: &str, err: impl std::fmt::Display) -> InventoryError {
    InventoryError::Serialization(format!("{prefix}: {err}"))
}
