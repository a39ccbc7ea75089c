//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Engine drivers (dial strings, connecting)
//! - Connection management and shutdown
//! - Execution contexts shared by pools and transactions
//! - The nest-safe transaction helper
//! - Schema migrations
//! - Type mappings and parameter binding
//! - Database dispatch macros for reducing code duplication

pub mod context;
pub mod driver;
#[macro_use]
pub mod macros;
pub mod migration;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use context::{ExecContext, TxHandle};
pub use driver::{Driver, PostgresDriver, SqliteDriver};
pub use migration::{MigrationReport, SCHEMA_VERSION, Script, ScriptSet};
pub use pool::{ConnectionSet, DbPool, ShutdownHook};
pub use transaction::{TransactionAbility, run_in_transaction, run_in_transaction_within};
