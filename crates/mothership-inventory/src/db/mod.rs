//! Abstract connection layer the inventory is written against.
//!
//! SQL handed to a [`Connection`] uses `$1`-style positional placeholders; drivers translate
//! them when the engine expects another syntax. Timestamps are always UTC.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::StoreError;

#[cfg(feature = "kernel-postgres")]
pub mod postgres;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite;

#[cfg(feature = "kernel-postgres")]
pub use postgres::PostgresConnection;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteConnection;

/// Storage engine flavour. Filters render engine-specific date arithmetic from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

/// A bound statement parameter or a decoded column value.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// One result row, addressed by column name.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn value(&self, column: &str) -> Result<&SqlValue, StoreError> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|idx| self.values.get(idx))
            .ok_or_else(|| StoreError::Column(format!("column '{}' not in result", column)))
    }

    pub fn get_i64(&self, column: &str) -> Result<i64, StoreError> {
        match self.value(column)? {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::Bool(b) => Ok(i64::from(*b)),
            other => Err(type_mismatch(column, "integer", other)),
        }
    }

    pub fn get_string(&self, column: &str) -> Result<String, StoreError> {
        match self.value(column)? {
            SqlValue::Text(s) => Ok(s.clone()),
            other => Err(type_mismatch(column, "text", other)),
        }
    }

    pub fn get_opt_string(&self, column: &str) -> Result<Option<String>, StoreError> {
        match self.value(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            other => Err(type_mismatch(column, "text", other)),
        }
    }

    pub fn get_bool(&self, column: &str) -> Result<bool, StoreError> {
        match self.value(column)? {
            SqlValue::Bool(b) => Ok(*b),
            SqlValue::Int(v) => Ok(*v != 0),
            other => Err(type_mismatch(column, "boolean", other)),
        }
    }

    pub fn get_timestamp(&self, column: &str) -> Result<DateTime<Utc>, StoreError> {
        match self.value(column)? {
            SqlValue::Timestamp(ts) => Ok(*ts),
            SqlValue::Text(s) => parse_timestamp(s)
                .ok_or_else(|| StoreError::Column(format!("column '{}': bad timestamp '{}'", column, s))),
            other => Err(type_mismatch(column, "timestamp", other)),
        }
    }
}

fn type_mismatch(column: &str, expected: &str, got: &SqlValue) -> StoreError {
    StoreError::Column(format!(
        "column '{}': expected {}, got {:?}",
        column, expected, got
    ))
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Text form used by engines without a native timestamp type. Lexically ordered.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Statement execution surface shared by plain connections and open transactions.
pub trait Connection {
    fn dialect(&self) -> Dialect;

    /// Executes a statement and returns the number of affected rows.
    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, StoreError>;

    /// Runs a query (including `INSERT .. RETURNING`) and collects all rows.
    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, StoreError>;

    /// Opens a transaction. On a transaction this opens a savepoint.
    fn begin(&self) -> Result<Transaction<'_>, StoreError>;

    fn query_one(&self, sql: &str, args: &[SqlValue]) -> Result<Option<Row>, StoreError> {
        Ok(self.query(sql, args)?.into_iter().next())
    }
}

/// Driver side of an open transaction.
pub trait TransactionHandle {
    fn dialect(&self) -> Dialect;
    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, StoreError>;
    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn rollback(&mut self) -> Result<(), StoreError>;
}

/// An open transaction. Dropping it without [`Transaction::commit`] rolls it back.
pub struct Transaction<'a> {
    handle: Box<dyn TransactionHandle + 'a>,
    depth: usize,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn new(handle: Box<dyn TransactionHandle + 'a>) -> Self {
        Self {
            handle,
            depth: 0,
            finished: false,
        }
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.handle.commit()
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.handle.rollback()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.handle.rollback() {
                log::warn!("db_transaction_rollback_failed depth={} error={}", self.depth, e);
            }
        }
    }
}

impl Connection for Transaction<'_> {
    fn dialect(&self) -> Dialect {
        self.handle.dialect()
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, StoreError> {
        self.handle.execute(sql, args)
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        self.handle.query(sql, args)
    }

    fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        let depth = self.depth + 1;
        let name = format!("mothership_sp_{}", depth);
        self.execute(&format!("SAVEPOINT {}", name), &[])?;
        Ok(Transaction {
            handle: Box::new(Savepoint { parent: self, name }),
            depth,
            finished: false,
        })
    }
}

struct Savepoint<'a> {
    parent: &'a dyn Connection,
    name: String,
}

impl TransactionHandle for Savepoint<'_> {
    fn dialect(&self) -> Dialect {
        self.parent.dialect()
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, StoreError> {
        self.parent.execute(sql, args)
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        self.parent.query(sql, args)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.parent
            .execute(&format!("RELEASE SAVEPOINT {}", self.name), &[])
            .map(|_| ())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.parent
            .execute(&format!("ROLLBACK TO SAVEPOINT {}", self.name), &[])?;
        self.parent
            .execute(&format!("RELEASE SAVEPOINT {}", self.name), &[])
            .map(|_| ())
    }
}

/// Runs `f` inside a transaction on `conn`: commits when it returns `Ok`, rolls back and
/// hands the error through unchanged otherwise.
pub fn transaction<C, T, E, F>(conn: &C, f: F) -> Result<T, E>
where
    C: Connection + ?Sized,
    E: From<StoreError>,
    F: FnOnce(&Transaction<'_>) -> Result<T, E>,
{
    let tx = conn.begin()?;
    match f(&tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rb) = tx.rollback() {
                log::warn!("db_transaction_rollback_failed error={}", rb);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn timestamp_text_round_trips_with_and_without_fraction() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01 12:30:05.000");
        assert_eq!(parse_timestamp("2024-03-01 12:30:05.000"), Some(ts));
        assert_eq!(parse_timestamp("2024-03-01 12:30:05"), Some(ts));
        assert_eq!(parse_timestamp("2024-03-01T12:30:05Z"), Some(ts));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn row_accessors_check_types() {
        let row = Row::new(
            vec!["id".into(), "status".into(), "flag".into(), "gone".into()],
            vec![
                SqlValue::Int(7),
                SqlValue::Text("Ready".into()),
                SqlValue::Int(1),
                SqlValue::Null,
            ],
        );
        assert_eq!(row.get_i64("id").expect("id"), 7);
        assert_eq!(row.get_string("STATUS").expect("status"), "Ready");
        assert!(row.get_bool("flag").expect("flag"));
        assert_eq!(row.get_opt_string("gone").expect("gone"), None);
        assert!(row.get_string("id").is_err());
        assert!(row.get_i64("missing").is_err());
    }
}
