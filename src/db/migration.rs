//! Schema migrations.
//!
//! Scripts are embedded at build time from `migrations/<engine>/` using the sqlx
//! file convention (`<version>_<description>.up.sql`). Only up scripts are ever
//! applied. Each script runs in its own transaction together with the row that
//! records it in `schema_migrations`, so the recorded version always matches the
//! schema actually present.

use crate::config::DatabaseConfig;
use crate::db::context::ExecContext;
use crate::db::pool::ConnectionSet;
use crate::db::transaction::run_in_transaction;
use crate::error::{DbError, DbResult};
use crate::models::Engine;
use serde::Serialize;
use sqlx::migrate::Migrator;
use std::collections::HashSet;
use tracing::{debug, info};

/// Version the running binary expects the schema to be at.
pub const SCHEMA_VERSION: i64 = 20241209;

static SQLITE_MIGRATOR: Migrator = sqlx::migrate!("./migrations/sqlite");
static POSTGRES_MIGRATOR: Migrator = sqlx::migrate!("./migrations/postgres");

/// One schema-change script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub version: i64,
    pub description: String,
    pub sql: String,
}

impl Script {
    pub fn new(version: i64, description: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            sql: sql.into(),
        }
    }
}

/// Ordered scripts for one engine.
#[derive(Debug, Clone)]
pub struct ScriptSet {
    engine: Engine,
    scripts: Vec<Script>,
}

impl ScriptSet {
    /// Sort `scripts` by version. Fails on non-positive or duplicate versions.
    pub fn new(engine: Engine, mut scripts: Vec<Script>) -> DbResult<Self> {
        scripts.sort_by_key(|s| s.version);

        let mut seen = HashSet::with_capacity(scripts.len());
        for script in &scripts {
            if script.version <= 0 {
                return Err(DbError::invalid_config(format!(
                    "migration version must be positive, got {}",
                    script.version
                )));
            }
            if !seen.insert(script.version) {
                return Err(DbError::invalid_config(format!(
                    "duplicate migration version {} for {}",
                    script.version, engine
                )));
            }
        }

        Ok(Self { engine, scripts })
    }

    /// Scripts bundled into the binary for `engine`.
    pub fn embedded(engine: Engine) -> DbResult<Self> {
        let migrator = match engine {
            Engine::SQLite => &SQLITE_MIGRATOR,
            Engine::Postgres => &POSTGRES_MIGRATOR,
        };
        Self::from_migrator(engine, migrator)
    }

    /// Up scripts of a sqlx migrator.
    pub fn from_migrator(engine: Engine, migrator: &Migrator) -> DbResult<Self> {
        let scripts = migrator
            .iter()
            .filter(|m| !m.migration_type.is_down_migration())
            .map(|m| Script::new(m.version, m.description.to_string(), m.sql.to_string()))
            .collect();
        Self::new(engine, scripts)
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn scripts(&self) -> &[Script] {
        &self.scripts
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.scripts.last().map(|s| s.version)
    }

    /// Scripts with `current < version <= target`, ascending.
    pub fn pending(&self, current: i64, target: i64) -> impl Iterator<Item = &Script> {
        self.scripts
            .iter()
            .filter(move |s| s.version > current && s.version <= target)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Version recorded before the run.
    pub previous: i64,
    /// Version recorded after the run.
    pub current: i64,
    /// Versions applied by this run; empty when nothing was pending.
    pub applied: Vec<i64>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Engine-specific bookkeeping statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    SQLite,
    Postgres,
}

impl Dialect {
    fn for_engine_name(name: &str) -> DbResult<Self> {
        Ok(match name.parse::<Engine>()? {
            Engine::SQLite => Dialect::SQLite,
            Engine::Postgres => Dialect::Postgres,
        })
    }

    fn engine(self) -> Engine {
        match self {
            Dialect::SQLite => Engine::SQLite,
            Dialect::Postgres => Engine::Postgres,
        }
    }

    fn create_version_table(self) -> &'static str {
        match self {
            Dialect::SQLite => {
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    description TEXT NOT NULL,
                    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                )"
            }
            Dialect::Postgres => {
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version BIGINT PRIMARY KEY,
                    description TEXT NOT NULL,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            }
        }
    }

    fn version_table_exists(self) -> &'static str {
        match self {
            Dialect::SQLite => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'"
            }
            Dialect::Postgres => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = 'schema_migrations'"
            }
        }
    }
}

const SELECT_CURRENT_VERSION: &str = "SELECT COALESCE(MAX(version), 0) FROM schema_migrations";
const INSERT_VERSION: &str = "INSERT INTO schema_migrations (version, description) VALUES ($1, $2)";

/// Highest recorded version, 0 when nothing has been applied yet.
/// Read-only: safe against the read handle.
pub async fn current_version(ctx: &ExecContext) -> DbResult<i64> {
    let dialect = Dialect::for_engine_name(ctx.engine().name())?;
    let exists: i64 = ctx
        .fetch_scalar(dialect.version_table_exists(), &[])
        .await?
        .unwrap_or_default();
    if exists == 0 {
        return Ok(0);
    }
    Ok(ctx
        .fetch_scalar(SELECT_CURRENT_VERSION, &[])
        .await?
        .unwrap_or_default())
}

/// Apply every script of `scripts` above the recorded version, up to `target`.
///
/// Runs on the read-write handle only. Stops at the first failing script; the
/// scripts before it stay applied and recorded.
pub async fn apply(
    set: &ConnectionSet,
    engine_name: &str,
    scripts: &ScriptSet,
    target: i64,
) -> DbResult<MigrationReport> {
    let dialect = Dialect::for_engine_name(engine_name)?;
    let engine = dialect.engine();
    if engine != set.engine() {
        return Err(DbError::invalid_config(format!(
            "cannot run {} migrations against a {} database",
            engine,
            set.engine()
        )));
    }
    if scripts.engine() != engine {
        return Err(DbError::invalid_config(format!(
            "script set is for {}, not {}",
            scripts.engine(),
            engine
        )));
    }

    let writer = set.writer();
    writer.execute(dialect.create_version_table(), &[]).await?;

    let previous = current_version(&writer).await?;
    let mut report = MigrationReport {
        previous,
        current: previous,
        applied: Vec::new(),
    };

    let pending: Vec<&Script> = scripts.pending(previous, target).collect();
    if pending.is_empty() {
        debug!(engine = %engine, version = previous, target, "Schema is up to date");
        return Ok(report);
    }

    info!(
        engine = %engine,
        from = previous,
        target,
        pending = pending.len(),
        "Applying schema migrations"
    );

    for script in pending {
        run_in_transaction(&writer, |tx| async move {
            tx.execute_script(&script.sql).await?;
            tx.execute(
                INSERT_VERSION,
                &[script.version.into(), script.description.as_str().into()],
            )
            .await?;
            Ok::<_, DbError>(())
        })
        .await
        .map_err(|e| DbError::migration(engine, script.version, e))?;

        info!(
            engine = %engine,
            version = script.version,
            description = %script.description,
            "Applied migration"
        );
        report.current = script.version;
        report.applied.push(script.version);
    }

    Ok(report)
}

/// Bring the schema to [`SCHEMA_VERSION`] when auto-migrate is enabled.
/// Returns `None` when auto-migrate is off.
pub async fn migrate_on_startup(
    set: &ConnectionSet,
    config: &DatabaseConfig,
) -> DbResult<Option<MigrationReport>> {
    if !config.auto_migrate {
        info!(engine = %set.engine(), "Auto-migrate disabled, skipping schema migrations");
        return Ok(None);
    }

    let scripts = ScriptSet::embedded(set.engine())?;
    let report = apply(set, set.engine().name(), &scripts, SCHEMA_VERSION).await?;
    info!(
        engine = %set.engine(),
        version = report.current,
        applied = report.applied.len(),
        "Schema migrations complete"
    );
    Ok(Some(report))
}
