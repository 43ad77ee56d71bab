// ABOUTME: MySQL/MariaDB-backed log store shared by the capture and apply engines
// ABOUTME: Hosts the durable event log and the identity relationship store

pub mod event_log;
pub mod relationships;
pub mod schema;

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Pool};

use crate::apply::dml::quote_mysql_ident;
use crate::config::LogStoreConfig;
use crate::error::StoreError;
use crate::retry::{retry_fixed, RetryFailure, RetryPolicy};

pub use event_log::EventLog;
pub use relationships::{MappingOutcome, RelationshipStore};

/// Connection pool to the log database.
///
/// Every operation checks out a fresh connection, so a retry after a dropped
/// connection is also a reconnect.
#[derive(Clone)]
pub struct LogStore {
    pool: Pool,
    policy: RetryPolicy,
}

impl LogStore {
    /// Connect to the log server, creating the log database and its tables on
    /// first use.
    pub async fn connect(
        config: &LogStoreConfig,
        project_name: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        let database = config.database_name(project_name);
        validate_database_name(&database)?;

        let server_opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(password.map(str::to_string));

        let bootstrap_opts = server_opts.clone();
        let create_database = format!(
            "CREATE DATABASE IF NOT EXISTS {} COLLATE utf8mb4_general_ci",
            quote_mysql_ident(&database)
        );
        retry_fixed(RetryPolicy::LOG_STORE, "log_store_bootstrap", |_| {
            let opts = bootstrap_opts.clone();
            let sql = create_database.clone();
            async move {
                let mut conn = Conn::new(opts).await?;
                conn.query_drop(sql).await?;
                conn.disconnect().await?;
                Ok::<_, mysql_async::Error>(())
            }
        })
        .await
        .map_err(|failure| store_error("log_store_bootstrap", failure))
        .with_context(|| format!("Failed to create log database {}", database))?;

        let pool = Pool::new(server_opts.db_name(Some(database.clone())));
        let store = Self::from_pool(pool, RetryPolicy::LOG_STORE);
        store
            .initialize()
            .await
            .with_context(|| format!("Failed to initialize log database {}", database))?;

        tracing::info!(
            host = %config.host,
            port = config.port,
            database = %database,
            "log database connection successful"
        );
        Ok(store)
    }

    /// Connect to an existing log database without creating anything, for
    /// read-only observers.
    pub async fn open_existing(
        config: &LogStoreConfig,
        project_name: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        let database = config.database_name(project_name);
        validate_database_name(&database)?;
        let opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(password.map(str::to_string))
            .db_name(Some(database));
        Ok(Self::from_pool(
            Pool::new(opts),
            RetryPolicy::new(3, Duration::from_secs(1)),
        ))
    }

    pub fn from_pool(pool: Pool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.with_retry("log_store_initialize", |_| async move {
            let mut conn = self.pool.get_conn().await?;
            for ddl in schema::ALL {
                conn.query_drop(*ddl).await?;
            }
            Ok(())
        })
        .await
    }

    /// Run one log-store operation under the store's retry policy.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, StoreError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, mysql_async::Error>>,
    {
        retry_fixed(self.policy, operation, op)
            .await
            .map_err(|failure| store_error(operation, failure))
    }

    /// Number of recorded events not yet applied.
    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let count: Option<u64> = self
            .with_retry("pending_count", |_| async move {
                let mut conn = pool.get_conn().await?;
                conn.query_first("SELECT COUNT(*) FROM captured_events WHERE applied = 0")
                    .await
            })
            .await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn disconnect(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .context("Failed to close log database pool")
    }
}

fn store_error(operation: &'static str, failure: RetryFailure<mysql_async::Error>) -> StoreError {
    match failure {
        RetryFailure::Exhausted { attempts, last } => StoreError::RetriesExhausted {
            operation,
            attempts,
            last_error: last.to_string(),
        },
        RetryFailure::Permanent(err) => StoreError::Rejected {
            operation,
            reason: err.to_string(),
        },
    }
}

fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        bail!("log database name must be 1-64 characters, got {:?}", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    {
        bail!(
            "log database name {:?} may only contain letters, digits, _ and $",
            name
        );
    }
    Ok(())
}

/// Format a timestamp for a DATETIME(3) column.
pub(crate) fn sql_datetime(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Parse a DATETIME column read back as text.
pub(crate) fn parse_sql_datetime(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
