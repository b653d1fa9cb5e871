//! Query execution with retry.
//!
//! A statement that fails with a retryable code (see [`classify`](super::classify))
//! is re-run after an exponential backoff of `1s, 2s, 4s`, for at most
//! [`MAX_RETRIES`] retries. Any other failure is returned on first occurrence.
//!
//! The backoff sleep goes through the [`Sleeper`] trait so tests can record
//! delays instead of waiting for them.

use crate::db::classify;
use crate::db::pool::ConnectionPool;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, QueryResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retries after the first attempt.
pub const MAX_RETRIES: u32 = 3;

/// Delay before the first retry; doubles each time.
pub const BASE_DELAY: Duration = Duration::from_millis(1000);

/// Delay before retry number `attempt` (0-indexed): `BASE_DELAY * 2^attempt`.
pub fn backoff_delay(attempt: u32) -> Duration {
    BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt))
}

/// Suspends the current task between retries.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Query executor that retries transient failures.
#[derive(Clone)]
pub struct QueryExecutor {
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("max_retries", &MAX_RETRIES)
            .field("base_delay", &BASE_DELAY)
            .finish()
    }
}

impl QueryExecutor {
    /// Create a new query executor sleeping on the tokio timer.
    pub fn new() -> Self {
        Self::with_sleeper(Arc::new(TokioSleeper))
    }

    /// Create a query executor with a custom sleeper.
    pub fn with_sleeper(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }

    /// Execute a statement against `pool`, retrying retryable failures.
    pub async fn execute(
        &self,
        pool: &dyn ConnectionPool,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        debug!(
            sql = %sql,
            param_types = ?params.iter().map(QueryParam::type_name).collect::<Vec<_>>(),
            "Executing query"
        );

        let mut attempt: u32 = 0;
        loop {
            match pool.execute(sql, params).await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            retries = attempt,
                            rows = result.row_count(),
                            "Query succeeded after retries"
                        );
                    }
                    return Ok(result);
                }
                Err(err) if attempt < MAX_RETRIES && classify::is_retryable(&err) => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        delay_ms = delay.as_millis() as u64,
                        code = err.code().unwrap_or_default(),
                        reason = err.code().and_then(classify::code_name).unwrap_or_default(),
                        error = %err,
                        "Retrying query after transient error"
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    log_failure(&err, attempt);
                    return Err(err);
                }
            }
        }
    }
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn log_failure(err: &DbError, retries: u32) {
    if retries > 0 && err.is_retryable() {
        error!(
            retries = retries,
            code = err.code().unwrap_or_default(),
            error = %err,
            "Query failed after exhausting retries"
        );
    } else {
        error!(
            retries = retries,
            code = err.code().unwrap_or_default(),
            error = %err,
            "Query failed"
        );
    }
}
