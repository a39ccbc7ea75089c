//! Execution contexts: the "either a pool or an open transaction" surface.
//!
//! Repository code is written against `ExecContext` and never needs to know whether
//! it runs standalone or as part of a caller's transaction. A pooled context checks
//! out a connection per call; a transactional context reuses the connection pinned
//! by the transaction until it is committed or rolled back.

use crate::db::params::{postgres_query, sqlite_query};
use crate::db::pool::DbPool;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{Engine, QueryParam, Row};
use sqlx::{Decode, PgConnection, Postgres, Sqlite, SqliteConnection, Transaction, Type};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Engine-specific transaction wrapper.
pub enum DbTransaction {
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    pub fn engine(&self) -> Engine {
        match self {
            DbTransaction::Postgres(_) => Engine::Postgres,
            DbTransaction::SQLite(_) => Engine::SQLite,
        }
    }

    async fn commit(self) -> DbResult<()> {
        let engine = self.engine();
        let result = match self {
            DbTransaction::Postgres(tx) => tx.commit().await,
            DbTransaction::SQLite(tx) => tx.commit().await,
        };
        result.map_err(|e| DbError::commit(engine, e.to_string()))
    }

    async fn rollback(self) -> DbResult<()> {
        let engine = self.engine();
        let result = match self {
            DbTransaction::Postgres(tx) => tx.rollback().await,
            DbTransaction::SQLite(tx) => tx.rollback().await,
        };
        result.map_err(|e| DbError::from_sqlx(engine, e))
    }
}

/// Shared handle to one open transaction.
///
/// Clones refer to the same transaction. Once it is committed or rolled back the
/// slot is empty and every further use fails with `UnsupportedContext`.
#[derive(Clone)]
pub struct TxHandle {
    id: Arc<str>,
    engine: Engine,
    inner: Arc<Mutex<Option<DbTransaction>>>,
}

impl TxHandle {
    /// Begin a transaction on `pool`.
    pub(crate) async fn begin(pool: &DbPool) -> DbResult<Self> {
        let engine = pool.engine();
        let tx = match pool {
            DbPool::Postgres(p) => p.begin().await.map(DbTransaction::Postgres),
            DbPool::SQLite(p) => p.begin().await.map(DbTransaction::SQLite),
        }
        .map_err(|e| DbError::begin_tx(engine, e.to_string()))?;

        let id: Arc<str> = format!("tx_{}", Uuid::new_v4().simple()).into();
        debug!(transaction_id = %id, engine = %engine, "Transaction started");

        Ok(Self {
            id,
            engine,
            inner: Arc::new(Mutex::new(Some(tx))),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Whether the transaction is still open.
    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    pub(crate) async fn commit(&self) -> DbResult<()> {
        let tx = self.take().await?;
        tx.commit().await?;
        debug!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    pub(crate) async fn rollback(&self) -> DbResult<()> {
        let tx = self.take().await?;
        tx.rollback().await?;
        debug!(transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }

    /// Drop the transaction without waiting, if nothing is using it right now.
    /// The driver rolls a dropped transaction back when its connection is reused.
    pub(crate) fn abandon(&self) {
        if let Ok(mut slot) = self.inner.try_lock() {
            if slot.take().is_some() {
                debug!(transaction_id = %self.id, "Transaction abandoned");
            }
        }
    }

    async fn take(&self) -> DbResult<DbTransaction> {
        self.inner
            .lock()
            .await
            .take()
            .ok_or_else(|| self.finished())
    }

    fn finished(&self) -> DbError {
        DbError::unsupported_context(format!(
            "transaction {} is no longer active",
            self.id
        ))
    }
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

/// Where a statement runs: a pool or an open transaction.
#[derive(Debug, Clone)]
pub enum ExecContext {
    Pool(DbPool),
    Transaction(TxHandle),
}

/// Run `$pg` or `$lite` with `$conn` bound to a live engine connection.
macro_rules! with_connection {
    ($ctx:expr, |$conn:ident| { Postgres => $pg:expr, SQLite => $lite:expr $(,)? }) => {
        match $ctx {
            ExecContext::Pool(DbPool::Postgres(pool)) => {
                let mut pooled = pool
                    .acquire()
                    .await
                    .map_err(|e| DbError::from_sqlx(Engine::Postgres, e))?;
                let $conn: &mut PgConnection = &mut pooled;
                $pg
            }
            ExecContext::Pool(DbPool::SQLite(pool)) => {
                let mut pooled = pool
                    .acquire()
                    .await
                    .map_err(|e| DbError::from_sqlx(Engine::SQLite, e))?;
                let $conn: &mut SqliteConnection = &mut pooled;
                $lite
            }
            ExecContext::Transaction(handle) => {
                let mut slot = handle.inner.lock().await;
                match slot.as_mut() {
                    Some(DbTransaction::Postgres(tx)) => {
                        let $conn: &mut PgConnection = tx;
                        $pg
                    }
                    Some(DbTransaction::SQLite(tx)) => {
                        let $conn: &mut SqliteConnection = tx;
                        $lite
                    }
                    None => Err(handle.finished()),
                }
            }
        }
    };
}

impl ExecContext {
    pub fn engine(&self) -> Engine {
        match self {
            ExecContext::Pool(pool) => pool.engine(),
            ExecContext::Transaction(tx) => tx.engine(),
        }
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self, ExecContext::Transaction(_))
    }

    /// The open transaction, if this context is transactional.
    pub fn tx_handle(&self) -> Option<&TxHandle> {
        match self {
            ExecContext::Transaction(tx) => Some(tx),
            ExecContext::Pool(_) => None,
        }
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        with_connection!(self, |conn| {
            Postgres => pg::execute(conn, sql, params).await,
            SQLite => lite::execute(conn, sql, params).await,
        })
    }

    /// Run a multi-statement script without parameters.
    pub async fn execute_script(&self, sql: &str) -> DbResult<()> {
        with_connection!(self, |conn| {
            Postgres => pg::execute_script(conn, sql).await,
            SQLite => lite::execute_script(conn, sql).await,
        })
    }

    pub async fn fetch_all(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        with_connection!(self, |conn| {
            Postgres => pg::fetch_all(conn, sql, params).await,
            SQLite => lite::fetch_all(conn, sql, params).await,
        })
    }

    pub async fn fetch_optional(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        with_connection!(self, |conn| {
            Postgres => pg::fetch_optional(conn, sql, params).await,
            SQLite => lite::fetch_optional(conn, sql, params).await,
        })
    }

    /// First column of the first row, or `None` when there are no rows.
    pub async fn fetch_scalar<T>(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<T>>
    where
        T: for<'r> Decode<'r, Postgres>
            + Type<Postgres>
            + for<'r> Decode<'r, Sqlite>
            + Type<Sqlite>
            + Send
            + Unpin,
    {
        with_connection!(self, |conn| {
            Postgres => pg::fetch_scalar(conn, sql, params).await,
            SQLite => lite::fetch_scalar(conn, sql, params).await,
        })
    }
}

impl From<DbPool> for ExecContext {
    fn from(pool: DbPool) -> Self {
        ExecContext::Pool(pool)
    }
}

impl From<TxHandle> for ExecContext {
    fn from(tx: TxHandle) -> Self {
        ExecContext::Transaction(tx)
    }
}

mod pg {
    use super::*;
    use sqlx::Row as _;

    fn err(e: sqlx::Error) -> DbError {
        DbError::from_sqlx(Engine::Postgres, e)
    }

    pub(super) async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        let query = postgres_query(sql, params);
        let result = query.execute(conn).await.map_err(err)?;
        Ok(result.rows_affected())
    }

    pub(super) async fn execute_script(conn: &mut PgConnection, sql: &str) -> DbResult<()> {
        sqlx::raw_sql(sql).execute(conn).await.map_err(err)?;
        Ok(())
    }

    pub(super) async fn fetch_all(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        let query = postgres_query(sql, params);
        let rows = query.fetch_all(conn).await.map_err(err)?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub(super) async fn fetch_optional(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<Row>> {
        let query = postgres_query(sql, params);
        let row = query.fetch_optional(conn).await.map_err(err)?;
        Ok(row.as_ref().map(RowToJson::to_json_map))
    }

    pub(super) async fn fetch_scalar<T>(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<T>>
    where
        T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
    {
        let query = postgres_query(sql, params);
        let row = query.fetch_optional(conn).await.map_err(err)?;
        row.map(|r| r.try_get::<T, _>(0)).transpose().map_err(err)
    }
}

mod lite {
    use super::*;
    use sqlx::Row as _;

    fn err(e: sqlx::Error) -> DbError {
        DbError::from_sqlx(Engine::SQLite, e)
    }

    pub(super) async fn execute(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        let query = sqlite_query(sql, params);
        let result = query.execute(conn).await.map_err(err)?;
        Ok(result.rows_affected())
    }

    pub(super) async fn execute_script(conn: &mut SqliteConnection, sql: &str) -> DbResult<()> {
        sqlx::raw_sql(sql).execute(conn).await.map_err(err)?;
        Ok(())
    }

    pub(super) async fn fetch_all(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        let query = sqlite_query(sql, params);
        let rows = query.fetch_all(conn).await.map_err(err)?;
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub(super) async fn fetch_optional(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<Row>> {
        let query = sqlite_query(sql, params);
        let row = query.fetch_optional(conn).await.map_err(err)?;
        Ok(row.as_ref().map(RowToJson::to_json_map))
    }

    pub(super) async fn fetch_scalar<T>(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<T>>
    where
        T: for<'r> Decode<'r, Sqlite> + Type<Sqlite>,
    {
        let query = sqlite_query(sql, params);
        let row = query.fetch_optional(conn).await.map_err(err)?;
        row.map(|r| r.try_get::<T, _>(0)).transpose().map_err(err)
    }
}
