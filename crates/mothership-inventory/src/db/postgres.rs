//! Postgres driver for the connection layer.
//!
//! This module is feature-gated behind `kernel-postgres`. Queries run on a dedicated runtime and
//! the caller waits on a channel, so the synchronous interface can be used from async tasks.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row as _, TypeInfo, ValueRef};

use super::{Connection, Dialect, Row, SqlValue, Transaction, TransactionHandle};
use crate::error::{map_driver_err, StoreError};

type PgTx = sqlx::Transaction<'static, Postgres>;

fn db_runtime() -> Result<Arc<tokio::runtime::Runtime>, String> {
    static DB_RT: OnceLock<Result<Arc<tokio::runtime::Runtime>, String>> = OnceLock::new();
    DB_RT
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(2)
                .thread_name("mothership-inventory-pg")
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
}

/// Lazily connected Postgres pool.
pub struct PostgresConnection {
    pool: PgPool,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl PostgresConnection {
    pub fn new(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = db_runtime().map_err(|e| map_driver_err("postgres runtime", e))?;
        let pool = {
            let _guard = runtime.enter();
            PgPoolOptions::new()
                .max_connections(max_connections)
                .connect_lazy(database_url)
                .map_err(|e| map_driver_err("postgres pool", e))?
        };
        Ok(Self { pool, runtime })
    }

    fn run<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        run_on(&self.runtime, fut)
    }
}

fn run_on<T, F>(runtime: &tokio::runtime::Runtime, fut: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, StoreError>> + Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    runtime.spawn(async move {
        let _ = tx.send(fut.await);
    });
    rx.recv()
        .map_err(|e| map_driver_err("postgres task dropped", e))?
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &[SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Timestamp(ts) => query.bind(*ts),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, StoreError> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());
        let raw = row
            .try_get_raw(idx)
            .map_err(|e| map_driver_err("read column", e))?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let value = match column.type_info().name() {
            "INT8" => SqlValue::Int(row.try_get::<i64, _>(idx).map_err(decode_err)?),
            "INT4" => SqlValue::Int(i64::from(row.try_get::<i32, _>(idx).map_err(decode_err)?)),
            "INT2" => SqlValue::Int(i64::from(row.try_get::<i16, _>(idx).map_err(decode_err)?)),
            "BOOL" => SqlValue::Bool(row.try_get::<bool, _>(idx).map_err(decode_err)?),
            "TIMESTAMPTZ" => SqlValue::Timestamp(
                row.try_get::<DateTime<Utc>, _>(idx).map_err(decode_err)?,
            ),
            "TIMESTAMP" => SqlValue::Timestamp(
                row.try_get::<NaiveDateTime, _>(idx)
                    .map_err(decode_err)?
                    .and_utc(),
            ),
            _ => SqlValue::Text(row.try_get::<String, _>(idx).map_err(decode_err)?),
        };
        values.push(value);
    }
    Ok(Row::new(columns, values))
}

fn decode_err(e: sqlx::Error) -> StoreError {
    map_driver_err("decode column", e)
}

impl Connection for PostgresConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        let sql = sql.to_string();
        let args = args.to_vec();
        self.run(async move {
            let result = bind_all(sqlx::query(&sql), &args)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("execute statement", e))?;
            Ok(result.rows_affected())
        })
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        let pool = self.pool.clone();
        let sql = sql.to_string();
        let args = args.to_vec();
        self.run(async move {
            let rows = bind_all(sqlx::query(&sql), &args)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("run query", e))?;
            rows.iter().map(decode_row).collect()
        })
    }

    fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        let pool = self.pool.clone();
        let tx = self.run(async move {
            pool.begin()
                .await
                .map_err(|e| StoreError::Transaction(format!("begin tx: {e}")))
        })?;
        Ok(Transaction::new(Box::new(PostgresTransaction {
            tx: Arc::new(tokio::sync::Mutex::new(Some(tx))),
            runtime: self.runtime.clone(),
        })))
    }
}

struct PostgresTransaction {
    tx: Arc<tokio::sync::Mutex<Option<PgTx>>>,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl PostgresTransaction {
    fn finish(&mut self, commit: bool) -> Result<(), StoreError> {
        let tx = self.tx.clone();
        run_on(&self.runtime, async move {
            let Some(tx) = tx.lock().await.take() else {
                return Ok(());
            };
            let result = if commit {
                tx.commit().await
            } else {
                tx.rollback().await
            };
            result.map_err(|e| StoreError::Transaction(format!("finish tx: {e}")))
        })
    }
}

impl TransactionHandle for PostgresTransaction {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> Result<u64, StoreError> {
        let tx = self.tx.clone();
        let sql = sql.to_string();
        let args = args.to_vec();
        run_on(&self.runtime, async move {
            let mut guard = tx.lock().await;
            let conn = guard
                .as_mut()
                .ok_or_else(|| StoreError::Transaction("transaction already finished".into()))?;
            let result = bind_all(sqlx::query(&sql), &args)
                .execute(&mut **conn)
                .await
                .map_err(|e| map_driver_err("execute statement", e))?;
            Ok(result.rows_affected())
        })
    }

    fn query(&self, sql: &str, args: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        let tx = self.tx.clone();
        let sql = sql.to_string();
        let args = args.to_vec();
        run_on(&self.runtime, async move {
            let mut guard = tx.lock().await;
            let conn = guard
                .as_mut()
                .ok_or_else(|| StoreError::Transaction("transaction already finished".into()))?;
            let rows = bind_all(sqlx::query(&sql), &args)
                .fetch_all(&mut **conn)
                .await
                .map_err(|e| map_driver_err("run query", e))?;
            rows.iter().map(decode_row).collect()
        })
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.finish(true)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.finish(false)
    }
}
