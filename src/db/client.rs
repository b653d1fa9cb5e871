//! The database client handed to services.
//!
//! `DatabaseClient` is built once by the application's composition root and
//! shared (by reference or `Arc`). It owns the credential resolver, the lazily
//! created pool, the retrying executor and the transaction coordinator.

use crate::config::{EnvSource, PoolOptions, ProcessEnv};
use crate::db::credentials::CredentialResolver;
use crate::db::executor::{QueryExecutor, Sleeper};
use crate::db::pool::{ConnectionPool, PgPoolFactory, PoolFactory, PoolManager};
use crate::db::secrets::SecretsProvider;
use crate::db::transaction::{Transaction, TransactionCoordinator};
use crate::error::{DbError, DbResult};
use crate::models::{Credentials, QueryParam, QueryResult};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug)]
pub struct DatabaseClient {
    pools: PoolManager,
    executor: QueryExecutor,
    transactions: TransactionCoordinator,
}

impl DatabaseClient {
    /// Assemble a client from its parts.
    pub fn new(
        resolver: CredentialResolver,
        factory: Arc<dyn PoolFactory>,
        options: PoolOptions,
    ) -> Self {
        Self {
            pools: PoolManager::new(resolver, factory, options),
            executor: QueryExecutor::new(),
            transactions: TransactionCoordinator::new(),
        }
    }

    /// Client for the process environment and a PostgreSQL pool.
    pub fn from_env(
        options: PoolOptions,
        secrets: Option<Arc<dyn SecretsProvider>>,
        secret_timeout: Duration,
    ) -> Self {
        let env: Arc<dyn EnvSource> = Arc::new(ProcessEnv);
        let mut resolver = CredentialResolver::new(env).with_secret_timeout(secret_timeout);
        if let Some(provider) = secrets {
            resolver = resolver.with_secrets(provider);
        }
        Self::new(resolver, Arc::new(PgPoolFactory), options)
    }

    /// Replace the backoff sleeper.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.executor = QueryExecutor::with_sleeper(sleeper);
        self
    }

    /// Resolved credentials (memoized).
    pub async fn credentials(&self) -> DbResult<Credentials> {
        self.pools.resolver().resolve().await
    }

    /// The pool, created on first use.
    pub async fn pool(&self) -> DbResult<Arc<dyn ConnectionPool>> {
        self.pools.get_pool().await
    }

    /// Run one statement, retrying transient failures.
    pub async fn execute_query(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let pool = self.pools.get_pool().await?;
        self.executor.execute(pool.as_ref(), sql, params).await
    }

    /// Like [`execute_query`](Self::execute_query), but gives up once `deadline`
    /// has elapsed, including time spent in backoff.
    pub async fn execute_query_within(
        &self,
        sql: &str,
        params: &[QueryParam],
        deadline: Duration,
    ) -> DbResult<QueryResult> {
        match tokio::time::timeout(deadline, self.execute_query(sql, params)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, sql = %sql, "Query deadline exceeded");
                Err(DbError::timeout(format!(
                    "query exceeded deadline of {}ms",
                    deadline.as_millis()
                )))
            }
        }
    }

    /// Run `work` atomically on one dedicated connection.
    ///
    /// ```ignore
    /// let id = client
    ///     .execute_transaction(|tx| Box::pin(async move {
    ///         let row = tx.execute("INSERT INTO users (name) VALUES ($1) RETURNING id", &["ada".into()]).await?;
    ///         tx.execute("INSERT INTO audit (event) VALUES ('user_created')", &[]).await?;
    ///         Ok(row.rows[0]["id"].clone())
    ///     }))
    ///     .await?;
    /// ```
    pub async fn execute_transaction<T, F>(&self, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut Transaction) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let pool = self.pools.get_pool().await?;
        self.transactions.execute(pool.as_ref(), work).await
    }

    /// Close the pool, if it was created.
    pub async fn close(&self) {
        self.pools.close().await;
    }
}
