//! Server (PostgreSQL) driver.

use super::{Driver, connect_within};
use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::models::{Access, Engine, SslMode};
use sqlx::pool::PoolOptions;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Session setting that makes every transaction on a connection read-only.
const READ_ONLY_OPTIONS: &str = "-c default_transaction_read_only=on";

#[derive(Clone)]
pub struct PostgresDriver {
    host: String,
    port: u16,
    user: String,
    /// Sensitive - never log
    password: String,
    name: String,
    ssl_mode: SslMode,
    connect_timeout: Duration,
}

impl PostgresDriver {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            name: config.name.clone(),
            ssl_mode: config.ssl_mode,
            connect_timeout: config.connect_timeout,
        }
    }

    fn base_url(&self) -> DbResult<Url> {
        let host = self.host.trim();
        // IPv6 literals need brackets in the authority
        let authority = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        };

        let mut url = Url::parse(&format!("postgres://{}", authority)).map_err(|e| {
            DbError::invalid_config(format!("invalid postgres host '{}': {}", host, e))
        })?;
        url.set_username(&self.user)
            .map_err(|_| DbError::invalid_config("postgres user cannot be set on this host"))?;
        if !self.password.is_empty() {
            url.set_password(Some(&self.password)).map_err(|_| {
                DbError::invalid_config("postgres password cannot be set on this host")
            })?;
        }
        url.set_path(&format!("/{}", self.name));
        Ok(url)
    }
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("name", &self.name)
            .field("ssl_mode", &self.ssl_mode)
            .finish_non_exhaustive()
    }
}

impl Driver for PostgresDriver {
    type Database = Postgres;

    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    fn dial_string(&self, access: Access) -> DbResult<String> {
        let mut url = self.base_url()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sslmode", self.ssl_mode.as_str());
            if access.is_read_only() {
                query.append_pair("options", READ_ONLY_OPTIONS);
            }
        }
        Ok(url.into())
    }

    async fn connect(
        &self,
        access: Access,
        options: PoolOptions<Postgres>,
    ) -> DbResult<Pool<Postgres>> {
        let dial = self.dial_string(access)?;
        let connect_options =
            PgConnectOptions::from_str(&dial).map_err(|e| DbError::from_sqlx(Engine::Postgres, e))?;

        debug!(
            host = %self.host,
            port = self.port,
            database = %self.name,
            ssl_mode = %self.ssl_mode,
            access = %access,
            "Opening postgres pool"
        );

        connect_within(
            Engine::Postgres,
            access,
            self.connect_timeout,
            options.connect_with(connect_options),
        )
        .await
    }
}
