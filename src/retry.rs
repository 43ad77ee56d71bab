// ABOUTME: Bounded fixed-delay retry for log-store and target writes
// ABOUTME: Also the exponential backoff used by the capture reconnect loop

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Server error codes worth retrying: too many connections, lock wait
/// timeout, deadlock, server gone away, lost connection.
const TRANSIENT_SERVER_CODES: &[u16] = &[1040, 1205, 1213, 2006, 2013];

/// Errors that can tell a connectivity blip from a permanent rejection.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for mysql_async::Error {
    fn is_transient(&self) -> bool {
        match self {
            mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => true,
            mysql_async::Error::Server(err) => TRANSIENT_SERVER_CODES.contains(&err.code),
            _ => false,
        }
    }
}

/// Local queue failures (SQLite busy, I/O) carry no classification worth
/// trusting, so every one is retried.
impl Transient for anyhow::Error {
    fn is_transient(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Event log and relationship store writes.
    pub const LOG_STORE: RetryPolicy = RetryPolicy {
        max_attempts: 15,
        delay: Duration::from_secs(1),
    };

    /// DML execution against the target database.
    pub const TARGET: RetryPolicy = RetryPolicy {
        max_attempts: 60,
        delay: Duration::from_secs(5),
    };

    /// Publishing a captured event to the work queue.
    pub const QUEUE: RetryPolicy = RetryPolicy {
        max_attempts: 10,
        delay: Duration::from_millis(500),
    };

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Every attempt hit a transient error.
    Exhausted { attempts: u32, last: E },
    /// A non-transient error stopped the loop early.
    Permanent(E),
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempt budget is spent.
///
/// The closure receives the 1-based attempt number. Each attempt is expected
/// to obtain a fresh connection, which is the reconnect step between tries.
pub async fn retry_fixed<T, E, F, Fut>(
    policy: RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    E: Transient + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        "reconnected, statement executed successfully"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => {
                tracing::error!(operation = operation_name, error = %err, "permanent failure");
                return Err(RetryFailure::Permanent(err));
            }
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %err,
                        "retry budget exhausted"
                    );
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                tracing::warn!(
                    operation = operation_name,
                    "failed (attempt {}/{}): {}, retrying in {:?}...",
                    attempt,
                    max_attempts,
                    err,
                    policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff with a ceiling, for loops that never give up.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
