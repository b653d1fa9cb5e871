//! Transactional execution with guaranteed rollback.
//!
//! [`TransactionCoordinator::execute`] opens a transaction on one dedicated
//! connection, hands it to the caller's unit of work, then commits on success
//! or rolls back on any error. The connection handle is owned by the
//! [`Transaction`], so it is released exactly once on every path; if the
//! future is dropped or the unit of work panics, dropping the handle rolls the
//! transaction back before the connection is reused. Nothing here is retried:
//! re-running a partially applied unit of work is not safe without
//! idempotency guarantees.

use crate::db::pool::{ConnectionPool, TransactionConnection};
use crate::error::DbResult;
use crate::models::{QueryParam, QueryResult};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A transaction in progress, owning its dedicated connection.
pub struct Transaction {
    id: String,
    conn: Box<dyn TransactionConnection>,
    started_at: DateTime<Utc>,
    started: Instant,
    statements: u32,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("statements", &self.statements)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    fn new(conn: Box<dyn TransactionConnection>) -> Self {
        Self {
            id: generate_transaction_id(),
            conn,
            started_at: Utc::now(),
            started: Instant::now(),
            statements: 0,
        }
    }

    /// Unique identifier for log correlation.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the transaction started (absolute time).
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Number of statements the unit of work has executed so far.
    pub fn statement_count(&self) -> u32 {
        self.statements
    }

    /// Execute a statement inside the transaction.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.statements += 1;
        debug!(
            transaction_id = %self.id,
            statement = self.statements,
            sql = %sql,
            "Executing statement in transaction"
        );
        self.conn.execute(sql, params).await
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", Uuid::new_v4().simple())
}

/// Runs units of work inside database transactions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionCoordinator;

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Run `work` inside a transaction on a dedicated connection from `pool`.
    ///
    /// Returns the unit of work's value after `COMMIT`. On failure the original
    /// error is returned after `ROLLBACK`; a failing rollback is logged only.
    pub async fn execute<T, F>(&self, pool: &dyn ConnectionPool, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Transaction) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let mut tx = Transaction::new(pool.begin().await?);
        info!(transaction_id = %tx.id, "Transaction started");

        let outcome = work(&mut tx).await;

        let duration_ms = tx.started.elapsed().as_millis() as u64;
        let Transaction {
            id,
            conn,
            statements,
            ..
        } = tx;

        match outcome {
            Ok(value) => match conn.commit().await {
                Ok(()) => {
                    info!(
                        transaction_id = %id,
                        statements = statements,
                        duration_ms = duration_ms,
                        "Transaction committed"
                    );
                    Ok(value)
                }
                Err(err) => {
                    // A failed COMMIT leaves the handle open; dropping it rolled back.
                    warn!(
                        transaction_id = %id,
                        statements = statements,
                        error = %err,
                        stage = "commit",
                        "Transaction rolled back"
                    );
                    Err(err)
                }
            },
            Err(err) => {
                match conn.rollback().await {
                    Ok(()) => warn!(
                        transaction_id = %id,
                        statements = statements,
                        error = %err,
                        stage = "work",
                        "Transaction rolled back"
                    ),
                    Err(rollback_err) => error!(
                        transaction_id = %id,
                        error = %err,
                        rollback_error = %rollback_err,
                        "Transaction rollback failed"
                    ),
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Journal {
        commands: Mutex<Vec<String>>,
        releases: Mutex<u32>,
    }

    impl Journal {
        fn record(&self, command: &str) {
            self.commands.lock().unwrap().push(command.to_string());
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn releases(&self) -> u32 {
            *self.releases.lock().unwrap()
        }
    }

    fn lost_connection() -> DbError {
        DbError::connection_with_code("connection lost", "08006", "")
    }

    /// Mirrors `sqlx::Transaction`: an open handle rolls back when dropped.
    struct FakeTx {
        journal: Arc<Journal>,
        fail_on: Option<&'static str>,
        open: bool,
    }

    impl Drop for FakeTx {
        fn drop(&mut self) {
            if self.open {
                self.journal.record("ROLLBACK");
            }
            *self.journal.releases.lock().unwrap() += 1;
        }
    }

    #[async_trait]
    impl TransactionConnection for FakeTx {
        async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<QueryResult> {
            self.journal.record(sql);
            if self.fail_on == Some(sql) {
                return Err(lost_connection());
            }
            Ok(QueryResult::affected(1))
        }

        async fn commit(self: Box<Self>) -> DbResult<()> {
            let mut this = self;
            this.journal.record("COMMIT");
            if this.fail_on == Some("COMMIT") {
                return Err(lost_connection());
            }
            this.open = false;
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> DbResult<()> {
            let mut this = self;
            if this.fail_on == Some("ROLLBACK") {
                return Err(lost_connection());
            }
            this.journal.record("ROLLBACK");
            this.open = false;
            Ok(())
        }
    }

    struct FakePool {
        journal: Arc<Journal>,
        fail_on: Option<&'static str>,
    }

    impl FakePool {
        fn new(fail_on: Option<&'static str>) -> Self {
            Self {
                journal: Arc::new(Journal::default()),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl ConnectionPool for FakePool {
        async fn execute(&self, _sql: &str, _params: &[QueryParam]) -> DbResult<QueryResult> {
            Err(DbError::internal("transactions must use a dedicated connection"))
        }

        async fn begin(&self) -> DbResult<Box<dyn TransactionConnection>> {
            self.journal.record("BEGIN");
            if self.fail_on == Some("BEGIN") {
                return Err(lost_connection());
            }
            Ok(Box::new(FakeTx {
                journal: self.journal.clone(),
                fail_on: self.fail_on,
                open: true,
            }))
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let pool = FakePool::new(None);
        let value = TransactionCoordinator::new()
            .execute(&pool, |tx| {
                Box::pin(async move {
                    tx.execute("INSERT INTO a VALUES (1)", &[]).await?;
                    Ok(tx.statement_count())
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(
            pool.journal.commands(),
            vec!["BEGIN", "INSERT INTO a VALUES (1)", "COMMIT"]
        );
        assert_eq!(pool.journal.releases(), 1);
    }

    #[tokio::test]
    async fn test_rollback_on_work_error() {
        let pool = FakePool::new(None);
        let err = TransactionCoordinator::new()
            .execute(&pool, |tx| {
                Box::pin(async move {
                    tx.execute("INSERT INTO a VALUES (1)", &[]).await?;
                    Err::<(), _>(DbError::invalid_input("business rule violated"))
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert_eq!(
            pool.journal.commands(),
            vec!["BEGIN", "INSERT INTO a VALUES (1)", "ROLLBACK"]
        );
        assert_eq!(pool.journal.releases(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_and_keeps_error() {
        let pool = FakePool::new(Some("COMMIT"));
        let err = TransactionCoordinator::new()
            .execute(&pool, |_tx| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some("08006"));
        assert_eq!(pool.journal.commands(), vec!["BEGIN", "COMMIT", "ROLLBACK"]);
        assert_eq!(pool.journal.releases(), 1);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_mask_original_error() {
        let pool = FakePool::new(Some("ROLLBACK"));
        let err = TransactionCoordinator::new()
            .execute(&pool, |_tx| {
                Box::pin(async move { Err::<(), _>(DbError::invalid_input("original")) })
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("original"));
        // The handle is still open after the failed ROLLBACK, so dropping it
        // queues another one before the connection is released.
        assert_eq!(pool.journal.commands(), vec!["BEGIN", "ROLLBACK"]);
        assert_eq!(pool.journal.releases(), 1);
    }

    #[tokio::test]
    async fn test_begin_failure_skips_work() {
        let pool = FakePool::new(Some("BEGIN"));
        let mut ran = false;
        let result = TransactionCoordinator::new()
            .execute(&pool, |_tx| {
                ran = true;
                Box::pin(async move { Ok(()) })
            })
            .await;

        assert_eq!(result.unwrap_err().code(), Some("08006"));
        assert!(!ran);
        assert_eq!(pool.journal.commands(), vec!["BEGIN"]);
        assert_eq!(pool.journal.releases(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_rolls_back() {
        let pool = FakePool::new(None);
        let coordinator = TransactionCoordinator::new();

        let pending = coordinator.execute(&pool, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO a VALUES (1)", &[]).await?;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(300), pending).await;

        assert!(timed_out.is_err());
        assert_eq!(
            pool.journal.commands(),
            vec!["BEGIN", "INSERT INTO a VALUES (1)", "ROLLBACK"]
        );
        assert_eq!(pool.journal.releases(), 1);
    }

    #[tokio::test]
    async fn test_panicking_work_rolls_back() {
        let pool = Arc::new(FakePool::new(None));
        let journal = pool.journal.clone();

        let task = tokio::spawn(async move {
            TransactionCoordinator::new()
                .execute(pool.as_ref(), |tx| {
                    Box::pin(async move {
                        tx.execute("INSERT INTO a VALUES (1)", &[]).await?;
                        if tx.statement_count() == 1 {
                            panic!("unit of work bug");
                        }
                        Ok(())
                    })
                })
                .await
        });

        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(
            journal.commands(),
            vec!["BEGIN", "INSERT INTO a VALUES (1)", "ROLLBACK"]
        );
        assert_eq!(journal.releases(), 1);
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = generate_transaction_id();
        let b = generate_transaction_id();
        assert!(a.starts_with("tx_"));
        assert_ne!(a, b);
    }
}
