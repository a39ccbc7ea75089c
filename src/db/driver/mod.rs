//! Storage engine drivers.
//!
//! A driver is configuration in, connection out: it knows how to build the dial
//! string for its engine and how to open a pool from it. Pool sizing is decided by
//! the connection manager and handed to the driver as `PoolOptions`.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

use crate::error::{DbError, DbResult};
use crate::models::{Access, Engine};
use sqlx::pool::PoolOptions;
use sqlx::{Database, Pool};
use std::future::Future;
use std::time::Duration;

/// Capability contract implemented once per engine.
pub trait Driver: Send + Sync {
    type Database: Database;

    /// Engine this driver talks to.
    fn engine(&self) -> Engine;

    /// Driver name. Also selects the migration dialect.
    fn name(&self) -> &'static str {
        self.engine().name()
    }

    /// Connection string for the given access mode. Contains credentials - never log.
    fn dial_string(&self, access: Access) -> DbResult<String>;

    /// Open a pool sized by `options`. Fails with `DbError::Connection` when the
    /// engine is unreachable, credentials are rejected or the file is unusable.
    fn connect(
        &self,
        access: Access,
        options: PoolOptions<Self::Database>,
    ) -> impl Future<Output = DbResult<Pool<Self::Database>>> + Send;
}

/// Run a connect future under `deadline`. At connect time an engine that cannot be
/// reached before the deadline is a connection failure, not a retryable timeout.
pub(crate) async fn connect_within<DB, F>(
    engine: Engine,
    access: Access,
    deadline: Duration,
    connect: F,
) -> DbResult<Pool<DB>>
where
    DB: Database,
    F: Future<Output = Result<Pool<DB>, sqlx::Error>>,
{
    match tokio::time::timeout(deadline, connect).await {
        Ok(Ok(pool)) => Ok(pool),
        Ok(Err(e)) => Err(DbError::connection(
            engine,
            format!("failed to open {} connection: {}", access, e),
        )),
        Err(_) => Err(DbError::connection(
            engine,
            format!(
                "failed to open {} connection: deadline of {}ms elapsed",
                access,
                deadline.as_millis()
            ),
        )),
    }
}
