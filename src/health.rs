//! Readiness probe for the storage layer.
//!
//! A failed ping is a degraded status, never an error: callers serve the report
//! as-is and keep running.

use crate::db::ConnectionSet;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    pub db_status: DbStatus,
}

impl HealthReport {
    /// Ping the read-write connection and report the result.
    pub async fn probe(set: &ConnectionSet) -> Self {
        let db_status = match set.ping().await {
            Ok(()) => DbStatus::Up,
            Err(e) => {
                warn!(
                    engine = %set.engine(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "Database health check failed"
                );
                DbStatus::Down
            }
        };

        Self {
            status: "ok",
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            db_status,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.db_status == DbStatus::Up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_probe_up_then_down() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig::sqlite(dir.path().join("health.db"));
        let (set, hook) = ConnectionSet::open(&config).await.unwrap();

        let report = HealthReport::probe(&set).await;
        assert!(report.is_healthy());
        assert_eq!(report.status, "ok");

        hook.stop().await.unwrap();

        let report = HealthReport::probe(&set).await;
        assert_eq!(report.db_status, DbStatus::Down);
        assert_eq!(report.status, "ok");
    }

    #[test]
    fn test_report_serialization() {
        let report = HealthReport {
            status: "ok",
            timestamp: Utc::now(),
            version: "0.1.0",
            db_status: DbStatus::Down,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["db_status"], "down");
        assert_eq!(json["status"], "ok");
        assert!(json["timestamp"].is_string());
    }
}
