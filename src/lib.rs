//! POS Storage Library
//!
//! One storage contract over an embedded SQLite file and a PostgreSQL server:
//! engine drivers, a read/read-write connection set, a nest-safe transaction
//! helper, an idempotent migration runner and a health probe.

pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod models;

pub use config::{Config, DatabaseConfig};
pub use db::{ConnectionSet, ExecContext, ShutdownHook, TransactionAbility};
pub use error::{DbError, DbResult};
pub use health::{DbStatus, HealthReport};
pub use models::{Access, Engine, QueryParam, Row};
