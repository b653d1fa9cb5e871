//! Connection pool management.
//!
//! The rest of the crate talks to the database through two small traits:
//! [`ConnectionPool`] (run a statement on any pooled connection, or open a
//! transaction on a dedicated one) and [`TransactionConnection`] (the open
//! transaction). [`PgConnectionPool`] is the sqlx-backed implementation; tests
//! substitute in-memory fakes.
//!
//! [`PoolManager`] owns exactly one pool, created on first use from the
//! resolved credentials.

use crate::config::PoolOptions;
use crate::db::credentials::CredentialResolver;
use crate::db::params::build_query;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{Credentials, QueryParam, QueryResult};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgSslMode};
use sqlx::{Either, PgPool, Postgres};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// A pool of database connections.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Run one statement; the pool checks a connection out and back in around it.
    async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult>;

    /// Check out a dedicated connection and issue `BEGIN` on it.
    async fn begin(&self) -> DbResult<Box<dyn TransactionConnection>>;

    /// Close the pool. Idle connections are closed; checked-out ones close on return.
    async fn close(&self);
}

/// An open transaction on a dedicated connection.
///
/// `commit` and `rollback` consume the handle and return the connection to its
/// pool. A handle dropped while still open (cancelled future, panic, failed
/// `commit` or `rollback`) rolls the transaction back before the connection
/// can be checked out again.
#[async_trait]
pub trait TransactionConnection: Send {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult>;

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}

/// Builds the pool once credentials are known.
#[async_trait]
pub trait PoolFactory: Send + Sync {
    async fn create(
        &self,
        credentials: &Credentials,
        options: &PoolOptions,
    ) -> DbResult<Arc<dyn ConnectionPool>>;
}

// =============================================================================
// PostgreSQL implementation
// =============================================================================

/// Run a statement on any Postgres executor, collecting rows and the affected count.
async fn run_statement<'e, 'c: 'e, E>(
    executor: E,
    sql: &'e str,
    params: &'e [QueryParam],
) -> DbResult<QueryResult>
where
    E: 'e + sqlx::Executor<'c, Database = Postgres>,
{
    #[allow(deprecated)]
    let mut stream = build_query(sql, params).fetch_many(executor);

    let mut result = QueryResult::default();
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => result.rows_affected += done.rows_affected(),
            Either::Right(row) => result.rows.push(row.to_json_map()),
        }
    }
    Ok(result)
}

/// sqlx-backed [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PgConnectionPool {
    pool: PgPool,
}

impl PgConnectionPool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Map a checkout failure to a [`DbError`].
    ///
    /// sqlx keeps retrying refused connects until the acquire timeout and then
    /// reports `PoolTimedOut`, which hides the cause. When the pool holds no
    /// connections at all, one direct connect attempt recovers the underlying
    /// error so a refused or unreachable server is classified by its code.
    async fn acquire_error(&self, err: sqlx::Error) -> DbError {
        if !matches!(err, sqlx::Error::PoolTimedOut) || self.pool.size() > 0 {
            return err.into();
        }

        let options = self.pool.connect_options();
        let timeout = self.pool.options().get_acquire_timeout();
        let attempt = <PgConnection as sqlx::Connection>::connect_with(&options);
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Err(connect_err)) => {
                debug!(error = %connect_err, "Recovered connect error behind pool timeout");
                connect_err.into()
            }
            Ok(Ok(conn)) => {
                // Server is reachable again; the pool was saturated or slow.
                let _ = sqlx::Connection::close(conn).await;
                err.into()
            }
            Err(_) => DbError::connection_with_code(
                format!("Connect timed out after {}ms", timeout.as_millis()),
                "ETIMEDOUT",
                "Check network connectivity and database server status",
            ),
        }
    }
}

#[async_trait]
impl ConnectionPool for PgConnectionPool {
    async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => return Err(self.acquire_error(e).await),
        };
        run_statement(&mut *conn, sql, params).await
    }

    async fn begin(&self) -> DbResult<Box<dyn TransactionConnection>> {
        match self.pool.begin().await {
            Ok(tx) => Ok(Box::new(PgTransaction { tx })),
            Err(e) => Err(self.acquire_error(e).await),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// A transaction on a dedicated [`PgConnectionPool`] connection.
///
/// Backed by `sqlx::Transaction`, which queues a `ROLLBACK` when dropped open;
/// the pool flushes it before the connection is handed out again.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl TransactionConnection for PgTransaction {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        run_statement(&mut *self.tx, sql, params).await
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.commit().await.map_err(DbError::from)
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        self.tx.rollback().await.map_err(DbError::from)
    }
}

/// Creates [`PgConnectionPool`]s with TLS and the idle-connection observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgPoolFactory;

impl PgPoolFactory {
    /// Driver connect options for `credentials`.
    pub fn connect_options(credentials: &Credentials, options: &PoolOptions) -> PgConnectOptions {
        let ssl_mode = match (credentials.require_tls, options.tls_verify_or_default()) {
            (false, _) => PgSslMode::Disable,
            // Encrypted, certificate not checked
            (true, false) => PgSslMode::Require,
            (true, true) => PgSslMode::VerifyFull,
        };

        PgConnectOptions::new()
            .host(&credentials.host)
            .port(credentials.port)
            .database(&credentials.database)
            .username(&credentials.username)
            .password(&credentials.password)
            .ssl_mode(ssl_mode)
    }
}

#[async_trait]
impl PoolFactory for PgPoolFactory {
    async fn create(
        &self,
        credentials: &Credentials,
        options: &PoolOptions,
    ) -> DbResult<Arc<dyn ConnectionPool>> {
        options.validate().map_err(DbError::configuration)?;

        let pool = PgPoolOptions::new()
            .min_connections(options.min_connections_or_default())
            .max_connections(options.max_connections_or_default())
            .acquire_timeout(options.acquire_timeout_or_default())
            .idle_timeout(Some(options.idle_timeout_or_default()))
            .test_before_acquire(false)
            .before_acquire(|conn, meta| {
                Box::pin(async move {
                    // Idle connections can die in the background (server restart,
                    // failover, NAT timeout). Log and discard instead of failing the caller.
                    match sqlx::Connection::ping(conn).await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            error!(
                                error = %e,
                                idle_for_ms = meta.idle_for.as_millis() as u64,
                                "Idle database connection failed; discarding it"
                            );
                            Ok(false)
                        }
                    }
                })
            })
            .after_connect(|_conn, _meta| {
                Box::pin(async move {
                    debug!("Opened database connection");
                    Ok(())
                })
            })
            .connect_lazy_with(Self::connect_options(credentials, options));

        info!(
            host = %credentials.host,
            port = credentials.port,
            database = %credentials.database,
            max_connections = options.max_connections_or_default(),
            min_connections = options.min_connections_or_default(),
            tls_verify = options.tls_verify_or_default(),
            "Created connection pool"
        );

        Ok(Arc::new(PgConnectionPool::new(pool)))
    }
}

// =============================================================================
// Pool manager
// =============================================================================

/// Owns the single lazily-created pool.
pub struct PoolManager {
    resolver: CredentialResolver,
    factory: Arc<dyn PoolFactory>,
    options: PoolOptions,
    pool: OnceCell<Arc<dyn ConnectionPool>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("resolver", &self.resolver)
            .field("options", &self.options)
            .field("initialized", &self.pool.initialized())
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    pub fn new(
        resolver: CredentialResolver,
        factory: Arc<dyn PoolFactory>,
        options: PoolOptions,
    ) -> Self {
        Self {
            resolver,
            factory,
            options,
            pool: OnceCell::new(),
        }
    }

    /// Get the pool, resolving credentials and creating it on first call.
    ///
    /// If credential resolution fails no pool is created and the error is returned.
    pub async fn get_pool(&self) -> DbResult<Arc<dyn ConnectionPool>> {
        self.pool
            .get_or_try_init(|| async {
                let credentials = self.resolver.resolve().await?;
                self.factory.create(&credentials, &self.options).await
            })
            .await
            .cloned()
    }

    /// Whether the pool has been created.
    pub fn is_initialized(&self) -> bool {
        self.pool.initialized()
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Close the pool if it was ever created.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            info!("Connection pool closed");
        }
    }
}
