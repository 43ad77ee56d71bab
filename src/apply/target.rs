// ABOUTME: Target database executor - runs synthesized DML with bounded retry
// ABOUTME: Binds JSON row values as mysql_async parameters

use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Opts, Params, Pool};
use serde_json::Value as JsonValue;

use super::dml::Statement;
use crate::config::sanitize_url;
use crate::error::TargetError;
use crate::retry::{retry_fixed, RetryFailure, RetryPolicy};

/// What the target reported for one executed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    pub affected_rows: u64,
    /// Id assigned by an AUTO_INCREMENT insert.
    pub last_insert_id: Option<u64>,
}

#[async_trait]
pub trait TargetDatabase: Send + Sync {
    async fn execute(&self, statement: &Statement) -> Result<ExecOutcome, TargetError>;
}

pub struct MySqlTarget {
    pool: Pool,
    policy: RetryPolicy,
}

impl MySqlTarget {
    pub fn connect(url: &str) -> Result<Self> {
        let opts = Opts::from_url(url)
            .with_context(|| format!("Invalid target url {}", sanitize_url(url)))?;
        tracing::info!(url = %sanitize_url(url), "target pool created");
        Ok(Self::with_policy(Pool::new(opts), RetryPolicy::TARGET))
    }

    pub fn with_policy(pool: Pool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn disconnect(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .context("Failed to close target pool")
    }
}

#[async_trait]
impl TargetDatabase for MySqlTarget {
    async fn execute(&self, statement: &Statement) -> Result<ExecOutcome, TargetError> {
        let pool = &self.pool;
        retry_fixed(self.policy, "target_execute", |_| {
            let params = bind_params(&statement.params);
            let sql = statement.sql.as_str();
            async move {
                let mut conn = pool.get_conn().await?;
                conn.exec_drop(sql, params).await?;
                Ok::<_, mysql_async::Error>(ExecOutcome {
                    affected_rows: conn.affected_rows(),
                    last_insert_id: conn.last_insert_id().filter(|id| *id != 0),
                })
            }
        })
        .await
        .map_err(|failure| match failure {
            RetryFailure::Exhausted { attempts, last } => TargetError::RetriesExhausted {
                attempts,
                last_error: last.to_string(),
            },
            RetryFailure::Permanent(err) => TargetError::Rejected {
                reason: err.to_string(),
            },
        })
    }
}

fn bind_params(values: &[JsonValue]) -> Params {
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values.iter().map(to_mysql_value).collect())
    }
}

/// Convert a captured JSON value to a bindable MySQL value.
pub fn to_mysql_value(value: &JsonValue) -> mysql_async::Value {
    use mysql_async::Value;
    match value {
        JsonValue::Null => Value::NULL,
        JsonValue::Bool(b) => Value::Int(i64::from(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Double(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => Value::Bytes(s.as_bytes().to_vec()),
        other => Value::Bytes(other.to_string().into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_scalars() {
        use mysql_async::Value;
        assert_eq!(to_mysql_value(&json!(null)), Value::NULL);
        assert_eq!(to_mysql_value(&json!(true)), Value::Int(1));
        assert_eq!(to_mysql_value(&json!(-5)), Value::Int(-5));
        assert_eq!(to_mysql_value(&json!(u64::MAX)), Value::UInt(u64::MAX));
        assert_eq!(to_mysql_value(&json!(2.5)), Value::Double(2.5));
        assert_eq!(to_mysql_value(&json!("abc")), Value::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn empty_params_bind_as_empty() {
        assert_eq!(bind_params(&[]), Params::Empty);
        assert_eq!(
            bind_params(&[json!(1)]),
            Params::Positional(vec![mysql_async::Value::Int(1)])
        );
    }
}
