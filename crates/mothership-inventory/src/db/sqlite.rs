//! SQLite driver for the connection layer.
//!
//! This module is feature-gated behind `sqlite-persistence`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;

use super::{format_timestamp, Connection, Dialect, Row, SqlValue, Transaction, TransactionHandle};
use crate::error::{map_driver_err, StoreError};

const BUSY_TIMEOUT_MS: i64 = 5_000;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Timestamp(ts) => ToSqlOutput::Owned(Value::Text(format_timestamp(ts))),
        })
    }
}

/// A single SQLite connection guarded by a mutex.
///
/// A transaction keeps the lock until it is committed or dropped, so statements issued on the
/// plain connection from the same thread while a transaction is open would deadlock. Code
/// inside a transaction must only use the transaction.
pub struct SqliteConnection {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteConnection {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| map_driver_err("create parent dir", e))?;
            }
        }
        let conn =
            rusqlite::Connection::open(path).map_err(|e| map_driver_err("open sqlite db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_driver_err("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| map_driver_err("set synchronous", e))?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| map_driver_err("open sqlite memory db", e))?;
        Self::configure(conn)
    }

    fn configure(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)
            .map_err(|e| map_driver_err("set busy_timeout", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| map_driver_err("lock poisoned", "mutex poisoned"))
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        execute_on(&conn, sql, args)
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        let conn = self.lock()?;
        query_on(&conn, sql, args)
    }

    fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| map_driver_err("begin tx", e))?;
        Ok(Transaction::new(Box::new(SqliteTransaction { conn })))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, rusqlite::Connection>,
}

impl TransactionHandle for SqliteTransaction<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, StoreError> {
        execute_on(&self.conn, sql, args)
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        query_on(&self.conn, sql, args)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| StoreError::Transaction(format!("commit tx: {e}")))
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| StoreError::Transaction(format!("rollback tx: {e}")))
    }
}

fn execute_on(conn: &rusqlite::Connection, sql: &str, args: &[SqlValue]) -> Result<u64, StoreError> {
    let sql = rewrite_placeholders(sql);
    let mut stmt = conn
        .prepare_cached(&sql)
        .map_err(|e| map_driver_err("prepare statement", e))?;
    let affected = stmt
        .execute(rusqlite::params_from_iter(args.iter()))
        .map_err(|e| map_driver_err("execute statement", e))?;
    Ok(affected as u64)
}

fn query_on(conn: &rusqlite::Connection, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
    let sql = rewrite_placeholders(sql);
    let mut stmt = conn
        .prepare_cached(&sql)
        .map_err(|e| map_driver_err("prepare query", e))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(args.iter()))
        .map_err(|e| map_driver_err("run query", e))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| map_driver_err("read row", e))? {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            let value = row
                .get_ref(idx)
                .map_err(|e| map_driver_err("read column", e))?;
            values.push(from_value_ref(value));
        }
        out.push(Row::new(columns.clone(), values));
    }
    Ok(out)
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Int(v),
        ValueRef::Real(v) => SqlValue::Text(v.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

/// Turns `$n` placeholders into SQLite's `?n`, leaving quoted literals untouched.
fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '$' if !in_literal && chars.peek().is_some_and(|n| n.is_ascii_digit()) => {
                out.push('?');
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::transaction;

    fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("mothership-sqlite-{}.db", uuid::Uuid::new_v4()))
    }

    fn open_with_table() -> SqliteConnection {
        let conn = SqliteConnection::open(temp_db_path()).expect("open sqlite");
        conn.execute(
            "CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
            &[],
        )
        .expect("create table");
        conn
    }

    fn count(conn: &dyn Connection) -> i64 {
        conn.query_one("SELECT COUNT(*) AS n FROM items", &[])
            .expect("count")
            .expect("row")
            .get_i64("n")
            .expect("n")
    }

    #[test]
    fn placeholders_are_rewritten_outside_literals() {
        assert_eq!(
            rewrite_placeholders("SELECT * FROM t WHERE a = $1 AND b = '$2' AND c = $10"),
            "SELECT * FROM t WHERE a = ?1 AND b = '$2' AND c = ?10"
        );
    }

    #[test]
    fn insert_returning_yields_generated_key() {
        let conn = open_with_table();
        let rows = conn
            .query(
                "INSERT INTO items (name) VALUES ($1) RETURNING id",
                &[SqlValue::from("a")],
            )
            .expect("insert");
        assert_eq!(rows[0].get_i64("id").expect("id"), 1);
    }

    #[test]
    fn failed_transaction_closure_rolls_back() {
        let conn = open_with_table();
        let result: Result<(), StoreError> = transaction(&conn, |tx| {
            tx.execute("INSERT INTO items (name) VALUES ($1)", &["a".into()])?;
            Err(StoreError::Transaction("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(count(&conn), 0);

        transaction::<_, _, StoreError, _>(&conn, |tx| {
            tx.execute("INSERT INTO items (name) VALUES ($1)", &["b".into()])?;
            Ok(())
        })
        .expect("commit");
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn savepoint_rollback_keeps_outer_work() {
        let conn = open_with_table();
        transaction::<_, _, StoreError, _>(&conn, |tx| {
            tx.execute("INSERT INTO items (name) VALUES ($1)", &["outer".into()])?;
            let inner: Result<(), StoreError> = transaction(tx, |sp| {
                sp.execute("INSERT INTO items (name) VALUES ($1)", &["inner".into()])?;
                Err(StoreError::Transaction("inner abort".into()))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .expect("outer commit");
        assert_eq!(count(&conn), 1);
    }
}
