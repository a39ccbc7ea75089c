//! Embedded (SQLite) driver.
//!
//! One database file, opened through two handles: a read-write handle that creates
//! the file and switches it to WAL, and a read-only handle that can never write.

use super::{Driver, connect_within};
use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::models::{Access, Engine};
use sqlx::pool::PoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SqliteDriver {
    path: PathBuf,
    busy_timeout: Duration,
    connect_timeout: Duration,
}

impl SqliteDriver {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
            connect_timeout,
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(
            config.storage_file_path.clone(),
            config.busy_timeout,
            config.connect_timeout,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Per-connection settings applied for the given access mode.
    ///
    /// `synchronous` is FULL: every commit is flushed before it is acknowledged.
    pub fn pragmas(&self, access: Access) -> Vec<(&'static str, String)> {
        let mut pragmas = vec![
            ("foreign_keys", "ON".to_string()),
            ("busy_timeout", self.busy_timeout.as_millis().to_string()),
            ("synchronous", "FULL".to_string()),
        ];
        if !access.is_read_only() {
            pragmas.push(("journal_mode", "WAL".to_string()));
        }
        pragmas
    }

    fn connect_options(&self, access: Access) -> DbResult<SqliteConnectOptions> {
        let dial = self.dial_string(access)?;
        let mut options = SqliteConnectOptions::from_str(&dial)
            .map_err(|e| DbError::from_sqlx(Engine::SQLite, e))?
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout)
            .synchronous(SqliteSynchronous::Full);

        if !access.is_read_only() {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        Ok(options)
    }

    async fn ensure_parent_dir(&self) -> DbResult<()> {
        let Some(parent) = self.path.parent() else {
            return Ok(());
        };
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DbError::connection(
                Engine::SQLite,
                format!("cannot create directory {}: {}", parent.display(), e),
            )
        })
    }
}

impl Driver for SqliteDriver {
    type Database = Sqlite;

    fn engine(&self) -> Engine {
        Engine::SQLite
    }

    fn dial_string(&self, access: Access) -> DbResult<String> {
        let path = self.path.to_str().ok_or_else(|| {
            DbError::invalid_config(format!(
                "storage path is not valid UTF-8: {}",
                self.path.display()
            ))
        })?;
        if path.is_empty() {
            return Err(DbError::invalid_config("storage path is empty"));
        }

        let mode = if access.is_read_only() { "ro" } else { "rwc" };
        Ok(format!("sqlite://{}?mode={}", path, mode))
    }

    async fn connect(
        &self,
        access: Access,
        options: PoolOptions<Sqlite>,
    ) -> DbResult<Pool<Sqlite>> {
        if !access.is_read_only() {
            self.ensure_parent_dir().await?;
        }
        let connect_options = self.connect_options(access)?;

        debug!(
            path = %self.path.display(),
            access = %access,
            pragmas = ?self.pragmas(access),
            "Opening sqlite pool"
        );

        connect_within(
            Engine::SQLite,
            access,
            self.connect_timeout,
            options.connect_with(connect_options),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn driver(path: impl Into<PathBuf>) -> SqliteDriver {
        SqliteDriver::new(path, Duration::from_millis(5000), Duration::from_secs(5))
    }

    #[test]
    fn test_dial_string_modes() {
        let d = driver("/var/lib/pos/pos.db");
        assert_eq!(
            d.dial_string(Access::ReadWrite).unwrap(),
            "sqlite:///var/lib/pos/pos.db?mode=rwc"
        );
        assert_eq!(
            d.dial_string(Access::ReadOnly).unwrap(),
            "sqlite:///var/lib/pos/pos.db?mode=ro"
        );
    }

    #[test]
    fn test_empty_path_rejected() {
        let err = driver("").dial_string(Access::ReadWrite).unwrap_err();
        assert!(matches!(err, DbError::InvalidConfig { .. }));
    }

    #[test]
    fn test_pragmas() {
        let d = driver("pos.db");
        let rw = d.pragmas(Access::ReadWrite);
        assert!(rw.contains(&("foreign_keys", "ON".to_string())));
        assert!(rw.contains(&("busy_timeout", "5000".to_string())));
        assert!(rw.contains(&("journal_mode", "WAL".to_string())));

        let ro = d.pragmas(Access::ReadOnly);
        assert!(ro.iter().all(|(name, _)| *name != "journal_mode"));
    }

    #[test]
    fn test_driver_name() {
        assert_eq!(driver("pos.db").name(), "sqlite");
    }

    #[tokio::test]
    async fn test_connect_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("pos.db");
        let d = driver(&path);

        let pool = d
            .connect(Access::ReadWrite, PoolOptions::new().max_connections(1))
            .await
            .unwrap();
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk, 1);
        pool.close().await;

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_read_only_connect_to_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path().join("missing.db"));

        let err = d
            .connect(Access::ReadOnly, PoolOptions::new().max_connections(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { engine: Engine::SQLite, .. }));
    }
}
