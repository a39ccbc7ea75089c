//! Configuration handling for the storage layer.
//!
//! This module provides configuration management via CLI arguments and environment
//! variables. `Config` is the raw surface; `DatabaseConfig` is the validated,
//! immutable view the drivers and the connection manager borrow.

use crate::error::{DbError, DbResult};
use crate::models::{Engine, SslMode};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DRIVER: &str = "sqlite";
pub const DEFAULT_STORAGE_FILE_PATH: &str = "./data/pos.db";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "pos";

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

// Pool sizing defaults
pub const DEFAULT_READ_POOL_MAX_OPEN: u32 = 10;
pub const DEFAULT_READ_POOL_IDLE: u32 = 5;
pub const DEFAULT_WRITE_POOL_MAX_OPEN: u32 = 1;
pub const DEFAULT_WRITE_POOL_IDLE: u32 = 1;
pub const DEFAULT_SERVER_POOL_MAX_OPEN: u32 = 25;
pub const DEFAULT_SERVER_POOL_IDLE: u32 = 5;

pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Size of one logical pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    /// Upper bound on open connections.
    pub max_open: u32,
    /// Connections kept warm (sqlx `min_connections`).
    pub idle: u32,
}

impl PoolSize {
    pub const fn new(max_open: u32, idle: u32) -> Self {
        Self { max_open, idle }
    }

    /// Validate the size and return an error message if invalid.
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.max_open == 0 {
            return Err(format!("{} max_open must be greater than 0", name));
        }
        if self.idle > self.max_open {
            return Err(format!(
                "{} idle ({}) cannot exceed max_open ({})",
                name, self.idle, self.max_open
            ));
        }
        Ok(())
    }
}

/// Validated storage configuration. Read-only after load.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub engine: Engine,
    pub auto_migrate: bool,
    /// Embedded engine only.
    pub storage_file_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Sensitive - never log
    pub password: String,
    pub name: String,
    pub ssl_mode: SslMode,
    pub busy_timeout: Duration,
    /// Embedded engine read pool.
    pub read_pool: PoolSize,
    /// Embedded engine write pool. `max_open` is capped at 1.
    pub write_pool: PoolSize,
    /// Server engine pool (and its optional read pool).
    pub server_pool: PoolSize,
    /// Server engine: open a dedicated read-only pool instead of aliasing the writer.
    pub separate_read_pool: bool,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub idle_timeout: Duration,
}

impl DatabaseConfig {
    /// Embedded-engine configuration with default tuning.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            engine: Engine::SQLite,
            storage_file_path: path.into(),
            ..Self::defaults()
        }
    }

    /// Server-engine configuration with default tuning.
    pub fn postgres(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            engine: Engine::Postgres,
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            name: name.into(),
            ..Self::defaults()
        }
    }

    fn defaults() -> Self {
        Self {
            engine: Engine::SQLite,
            auto_migrate: true,
            storage_file_path: PathBuf::from(DEFAULT_STORAGE_FILE_PATH),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            name: DEFAULT_DATABASE_NAME.to_string(),
            ssl_mode: SslMode::Disable,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            read_pool: PoolSize::new(DEFAULT_READ_POOL_MAX_OPEN, DEFAULT_READ_POOL_IDLE),
            write_pool: PoolSize::new(DEFAULT_WRITE_POOL_MAX_OPEN, DEFAULT_WRITE_POOL_IDLE),
            server_pool: PoolSize::new(DEFAULT_SERVER_POOL_MAX_OPEN, DEFAULT_SERVER_POOL_IDLE),
            separate_read_pool: false,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// Reject configurations the connection manager cannot honour.
    pub fn validate(&self) -> DbResult<()> {
        let check = |r: Result<(), String>| r.map_err(DbError::invalid_config);

        match self.engine {
            Engine::SQLite => {
                if self.storage_file_path.as_os_str().is_empty() {
                    return Err(DbError::invalid_config(
                        "storage_file_path is required for the sqlite engine",
                    ));
                }
                check(self.read_pool.validate("read_pool"))?;
                check(self.write_pool.validate("write_pool"))?;
            }
            Engine::Postgres => {
                if self.host.trim().is_empty() {
                    return Err(DbError::invalid_config(
                        "host is required for the postgres engine",
                    ));
                }
                if self.name.trim().is_empty() {
                    return Err(DbError::invalid_config(
                        "database name is required for the postgres engine",
                    ));
                }
                check(self.server_pool.validate("server_pool"))?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("engine", &self.engine)
            .field("auto_migrate", &self.auto_migrate)
            .field("storage_file_path", &self.storage_file_path)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"****")
            .field("name", &self.name)
            .field("ssl_mode", &self.ssl_mode)
            .field("busy_timeout", &self.busy_timeout)
            .field("read_pool", &self.read_pool)
            .field("write_pool", &self.write_pool)
            .field("server_pool", &self.server_pool)
            .field("separate_read_pool", &self.separate_read_pool)
            .finish_non_exhaustive()
    }
}

/// Configuration for the POS storage layer.
#[derive(Clone, Parser)]
#[command(
    name = "pos-storage",
    about = "Storage layer for the POS backend - SQLite or PostgreSQL behind one contract",
    version,
    author
)]
pub struct Config {
    /// Storage engine (sqlite or postgres)
    #[arg(long, default_value = DEFAULT_DRIVER, env = "DATABASE_DRIVER")]
    pub driver: String,

    /// Apply pending schema migrations at startup
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        env = "DATABASE_AUTO_MIGRATE"
    )]
    pub auto_migrate: bool,

    /// Database file for the sqlite engine
    #[arg(
        long,
        default_value = DEFAULT_STORAGE_FILE_PATH,
        env = "DATABASE_STORAGE_FILE_PATH"
    )]
    pub storage_file_path: PathBuf,

    /// Server host (postgres)
    #[arg(long = "db-host", default_value = DEFAULT_HOST, env = "DATABASE_HOST")]
    pub host: String,

    /// Server port (postgres)
    #[arg(long = "db-port", default_value_t = DEFAULT_PORT, env = "DATABASE_PORT")]
    pub port: u16,

    /// Server user (postgres)
    #[arg(long = "db-user", default_value = DEFAULT_USER, env = "DATABASE_USER")]
    pub user: String,

    /// Server password (postgres)
    #[arg(
        long = "db-password",
        default_value = "",
        env = "DATABASE_PASSWORD",
        hide_env_values = true
    )]
    pub password: String,

    /// Database name (postgres)
    #[arg(long = "db-name", default_value = DEFAULT_DATABASE_NAME, env = "DATABASE_NAME")]
    pub name: String,

    /// TLS mode (postgres)
    #[arg(long, value_enum, default_value = "disable", env = "DATABASE_SSL_MODE")]
    pub ssl_mode: SslMode,

    /// Lock-wait timeout for the sqlite engine, in milliseconds
    #[arg(
        long,
        default_value_t = DEFAULT_BUSY_TIMEOUT_MS,
        env = "DATABASE_BUSY_TIMEOUT_MS"
    )]
    pub busy_timeout_ms: u64,

    /// Maximum open connections in the sqlite read pool
    #[arg(long, default_value_t = DEFAULT_READ_POOL_MAX_OPEN, env = "DATABASE_READ_POOL_MAX_OPEN")]
    pub read_pool_max_open: u32,

    /// Warm connections in the sqlite read pool
    #[arg(long, default_value_t = DEFAULT_READ_POOL_IDLE, env = "DATABASE_READ_POOL_IDLE")]
    pub read_pool_idle: u32,

    /// Warm connections in the sqlite write pool (0 or 1)
    #[arg(long, default_value_t = DEFAULT_WRITE_POOL_IDLE, env = "DATABASE_WRITE_POOL_IDLE")]
    pub write_pool_idle: u32,

    /// Maximum open connections in the postgres pool
    #[arg(
        long,
        default_value_t = DEFAULT_SERVER_POOL_MAX_OPEN,
        env = "DATABASE_SERVER_POOL_MAX_OPEN"
    )]
    pub server_pool_max_open: u32,

    /// Warm connections in the postgres pool
    #[arg(long, default_value_t = DEFAULT_SERVER_POOL_IDLE, env = "DATABASE_SERVER_POOL_IDLE")]
    pub server_pool_idle: u32,

    /// Open a dedicated read-only pool for postgres instead of sharing the writer
    #[arg(long, env = "DATABASE_SEPARATE_READ_POOL")]
    pub separate_read_pool: bool,

    /// Connection acquire timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS,
        env = "DATABASE_ACQUIRE_TIMEOUT"
    )]
    pub acquire_timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS,
        env = "DATABASE_CONNECT_TIMEOUT"
    )]
    pub connect_timeout: u64,

    /// Time allowed for closing pools at shutdown, in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        env = "DATABASE_SHUTDOWN_TIMEOUT"
    )]
    pub shutdown_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DATABASE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DATABASE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            driver: DEFAULT_DRIVER.to_string(),
            auto_migrate: true,
            storage_file_path: PathBuf::from(DEFAULT_STORAGE_FILE_PATH),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            name: DEFAULT_DATABASE_NAME.to_string(),
            ssl_mode: SslMode::Disable,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            read_pool_max_open: DEFAULT_READ_POOL_MAX_OPEN,
            read_pool_idle: DEFAULT_READ_POOL_IDLE,
            write_pool_idle: DEFAULT_WRITE_POOL_IDLE,
            server_pool_max_open: DEFAULT_SERVER_POOL_MAX_OPEN,
            server_pool_idle: DEFAULT_SERVER_POOL_IDLE,
            separate_read_pool: false,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Resolve the engine selector and build the validated storage configuration.
    pub fn database(&self) -> DbResult<DatabaseConfig> {
        let engine: Engine = self.driver.parse()?;

        let config = DatabaseConfig {
            engine,
            auto_migrate: self.auto_migrate,
            storage_file_path: self.storage_file_path.clone(),
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            name: self.name.clone(),
            ssl_mode: self.ssl_mode,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            read_pool: PoolSize::new(self.read_pool_max_open, self.read_pool_idle),
            write_pool: PoolSize::new(DEFAULT_WRITE_POOL_MAX_OPEN, self.write_pool_idle),
            server_pool: PoolSize::new(self.server_pool_max_open, self.server_pool_idle),
            separate_read_pool: self.separate_read_pool,
            acquire_timeout: Duration::from_secs(self.acquire_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("driver", &self.driver)
            .field("auto_migrate", &self.auto_migrate)
            .field("storage_file_path", &self.storage_file_path)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"****")
            .field("name", &self.name)
            .field("ssl_mode", &self.ssl_mode)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .field("read_pool_max_open", &self.read_pool_max_open)
            .field("read_pool_idle", &self.read_pool_idle)
            .field("write_pool_idle", &self.write_pool_idle)
            .field("server_pool_max_open", &self.server_pool_max_open)
            .field("server_pool_idle", &self.server_pool_idle)
            .field("separate_read_pool", &self.separate_read_pool)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("log_level", &self.log_level)
            .field("json_logs", &self.json_logs)
            .finish()
    }
}
