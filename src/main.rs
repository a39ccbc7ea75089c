//! POS Storage - Main entry point.
//!
//! Opens the configured database, brings the schema up to date and holds the
//! connections until Ctrl-C. HTTP serving lives elsewhere.

use clap::Parser;
use pos_storage::config::Config;
use pos_storage::db::ConnectionSet;
use pos_storage::db::migration::migrate_on_startup;
use pos_storage::health::HealthReport;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(
        driver = %config.driver,
        "Starting POS storage v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db_config = config.database()?;
    let (connections, shutdown) = ConnectionSet::open(&db_config).await?;

    // No traffic against an unmigrated schema
    if let Err(e) = migrate_on_startup(&connections, &db_config).await {
        error!(error = %e, "Schema migration failed");
        if let Err(close_err) = shutdown.stop().await {
            error!(error = %close_err, "Failed to close database connections");
        }
        return Err(e.into());
    }

    let health = HealthReport::probe(&connections).await;
    info!(
        db_status = ?health.db_status,
        version = health.version,
        "Storage ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = shutdown.stop().await {
        error!(error = %e, "Failed to close database connections");
        return Err(e.into());
    }

    info!("Storage shutdown complete");
    Ok(())
}
