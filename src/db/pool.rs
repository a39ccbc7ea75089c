//! Connection management.
//!
//! `ConnectionSet::open` turns a validated `DatabaseConfig` into a read pool and a
//! read-write pool and hands back a `ShutdownHook` that closes them. The embedded
//! engine gets two physically separate pools over the same file, with a single
//! writer connection. The server engine shares one pool for both roles unless a
//! dedicated read-only pool is requested.

use crate::config::{DatabaseConfig, PoolSize};
use crate::db::context::ExecContext;
use crate::db::driver::{Driver, PostgresDriver, SqliteDriver};
use crate::error::{DbError, DbResult};
use crate::models::{Access, Engine};
use sqlx::pool::PoolOptions;
use sqlx::{Database, PgPool, SqlitePool};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool. Waits for checked-out connections to be returned.
    pub async fn close(&self) {
        impl_db_dispatch!(self, {
            Postgres(p) => p.close().await,
            SQLite(p) => p.close().await,
        })
    }

    pub fn engine(&self) -> Engine {
        match self {
            DbPool::Postgres(_) => Engine::Postgres,
            DbPool::SQLite(_) => Engine::SQLite,
        }
    }

    /// Connections currently open (idle and in use).
    pub fn size(&self) -> u32 {
        impl_db_dispatch!(self, {
            Postgres(p) => p.size(),
            SQLite(p) => p.size(),
        })
    }

    pub fn num_idle(&self) -> usize {
        impl_db_dispatch!(self, {
            Postgres(p) => p.num_idle(),
            SQLite(p) => p.num_idle(),
        })
    }

    /// Upper bound on open connections this pool was built with.
    pub fn max_connections(&self) -> u32 {
        impl_db_dispatch!(self, {
            Postgres(p) => p.options().get_max_connections(),
            SQLite(p) => p.options().get_max_connections(),
        })
    }

    pub fn is_closed(&self) -> bool {
        impl_db_dispatch!(self, {
            Postgres(p) => p.is_closed(),
            SQLite(p) => p.is_closed(),
        })
    }

    /// Round-trip a trivial statement.
    pub async fn ping(&self) -> DbResult<()> {
        let engine = self.engine();
        let result = impl_db_dispatch!(self, {
            Postgres(p) => sqlx::query("SELECT 1").execute(p).await.map(|_| ()),
            SQLite(p) => sqlx::query("SELECT 1").execute(p).await.map(|_| ()),
        });
        result.map_err(|e| DbError::from_sqlx(engine, e))
    }

    /// Whether both handles point at the same underlying pool.
    fn same_pool(&self, other: &DbPool) -> bool {
        match (self, other) {
            // Clones of a sqlx pool share their options allocation
            (DbPool::Postgres(a), DbPool::Postgres(b)) => std::ptr::eq(a.options(), b.options()),
            (DbPool::SQLite(a), DbPool::SQLite(b)) => std::ptr::eq(a.options(), b.options()),
            _ => false,
        }
    }
}

/// Build sqlx pool options from a logical pool size.
fn pool_options<DB: Database>(size: PoolSize, config: &DatabaseConfig) -> PoolOptions<DB> {
    PoolOptions::<DB>::new()
        .max_connections(size.max_open)
        .min_connections(size.idle)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(Some(config.idle_timeout))
}

/// The read and read-write handles for one database.
#[derive(Debug, Clone)]
pub struct ConnectionSet {
    engine: Engine,
    read: DbPool,
    write: DbPool,
    shared: bool,
}

impl ConnectionSet {
    /// Open every pool the configured engine needs.
    ///
    /// A failure while opening the read pool closes the already-open write pool
    /// before the error is returned.
    pub async fn open(config: &DatabaseConfig) -> DbResult<(Self, ShutdownHook)> {
        config.validate()?;

        info!(
            engine = %config.engine,
            auto_migrate = config.auto_migrate,
            "Opening database connections"
        );

        let set = match config.engine {
            Engine::SQLite => Self::open_sqlite(config).await?,
            Engine::Postgres => Self::open_postgres(config).await?,
        };

        info!(
            engine = %set.engine,
            shared = set.shared,
            read_max_connections = set.read.max_connections(),
            write_max_connections = set.write.max_connections(),
            "Database connections ready"
        );

        let hook = ShutdownHook::new(&set, config.shutdown_timeout);
        Ok((set, hook))
    }

    async fn open_sqlite(config: &DatabaseConfig) -> DbResult<Self> {
        let driver = SqliteDriver::from_config(config);
        // One writer, whatever the configuration asks for
        let write_size = PoolSize::new(1, config.write_pool.idle.min(1));
        if config.write_pool.max_open != 1 {
            warn!(
                requested = config.write_pool.max_open,
                "Embedded write pool is limited to a single connection"
            );
        }
        // The read-write handle goes first: it creates the file the read-only handle opens.
        let write = driver
            .connect(Access::ReadWrite, pool_options(write_size, config))
            .await?;
        let read = match driver
            .connect(Access::ReadOnly, pool_options(config.read_pool, config))
            .await
        {
            Ok(pool) => pool,
            Err(e) => {
                write.close().await;
                return Err(e);
            }
        };

        Ok(Self {
            engine: Engine::SQLite,
            read: DbPool::SQLite(read),
            write: DbPool::SQLite(write),
            shared: false,
        })
    }

    async fn open_postgres(config: &DatabaseConfig) -> DbResult<Self> {
        let driver = PostgresDriver::from_config(config);
        let write = driver
            .connect(Access::ReadWrite, pool_options(config.server_pool, config))
            .await?;

        if !config.separate_read_pool {
            let pool = DbPool::Postgres(write);
            return Ok(Self {
                engine: Engine::Postgres,
                read: pool.clone(),
                write: pool,
                shared: true,
            });
        }

        let read = match driver
            .connect(Access::ReadOnly, pool_options(config.server_pool, config))
            .await
        {
            Ok(pool) => pool,
            Err(e) => {
                write.close().await;
                return Err(e);
            }
        };

        Ok(Self {
            engine: Engine::Postgres,
            read: DbPool::Postgres(read),
            write: DbPool::Postgres(write),
            shared: false,
        })
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Read connection.
    pub fn read_pool(&self) -> &DbPool {
        &self.read
    }

    /// Read-write connection.
    pub fn write_pool(&self) -> &DbPool {
        &self.write
    }

    /// Read execution context.
    pub fn reader(&self) -> ExecContext {
        ExecContext::Pool(self.read.clone())
    }

    /// Read-write execution context.
    pub fn writer(&self) -> ExecContext {
        ExecContext::Pool(self.write.clone())
    }

    /// Whether the read handle aliases the read-write handle.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Ping the read-write connection.
    pub async fn ping(&self) -> DbResult<()> {
        self.write.ping().await
    }
}

/// Closes every distinct pool of a `ConnectionSet` exactly once.
///
/// `stop` consumes the hook. Pools are closed in order (read-write first) and a
/// failure to close one does not prevent closing the others.
#[must_use = "connections stay open until the hook is stopped"]
#[derive(Debug)]
pub struct ShutdownHook {
    pools: Vec<(&'static str, DbPool)>,
    timeout: Duration,
}

impl ShutdownHook {
    fn new(set: &ConnectionSet, timeout: Duration) -> Self {
        let mut pools = vec![("read-write", set.write.clone())];
        if !set.shared && !set.read.same_pool(&set.write) {
            pools.push(("read", set.read.clone()));
        }
        Self { pools, timeout }
    }

    /// Number of distinct pools this hook will close.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Close all owned pools. Failures are joined, not short-circuited.
    pub async fn stop(self) -> DbResult<()> {
        let mut errors = Vec::new();

        for (role, pool) in self.pools {
            let engine = pool.engine();
            debug!(engine = %engine, role, "Closing pool");
            match tokio::time::timeout(self.timeout, pool.close()).await {
                Ok(()) => info!(engine = %engine, role, "Pool closed"),
                Err(_) => {
                    warn!(
                        engine = %engine,
                        role,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Pool did not close before the shutdown deadline"
                    );
                    errors.push(DbError::timeout(
                        format!("closing {} {} pool", engine, role),
                        self.timeout,
                    ));
                }
            }
        }

        DbError::join(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sqlite_config(dir: &TempDir) -> DatabaseConfig {
        DatabaseConfig::sqlite(dir.path().join("pos.db"))
    }

    #[tokio::test]
    async fn test_open_sqlite_pool_sizes() {
        let dir = TempDir::new().unwrap();
        let (set, hook) = ConnectionSet::open(&sqlite_config(&dir)).await.unwrap();

        assert_eq!(set.engine(), Engine::SQLite);
        assert!(!set.is_shared());
        assert_eq!(set.write_pool().max_connections(), 1);
        assert_eq!(set.read_pool().max_connections(), 10);
        assert!(set.write_pool().size() <= 1);
        assert_eq!(hook.pool_count(), 2);

        set.ping().await.unwrap();
        hook.stop().await.unwrap();
        assert!(set.write_pool().is_closed());
        assert!(set.read_pool().is_closed());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut config = DatabaseConfig::sqlite("pos.db");
        config.read_pool = PoolSize::new(0, 0);
        let err = ConnectionSet::open(&config).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_same_pool_detects_clones() {
        let dir = TempDir::new().unwrap();
        let (set, hook) = ConnectionSet::open(&sqlite_config(&dir)).await.unwrap();

        let write = set.write_pool().clone();
        assert!(write.same_pool(set.write_pool()));
        assert!(!write.same_pool(set.read_pool()));

        hook.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let (set, hook) = ConnectionSet::open(&sqlite_config(&dir)).await.unwrap();
        hook.stop().await.unwrap();

        let err = set.ping().await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
    }
}
