//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Credential resolution (tunnel, direct, secrets store)
//! - Lazy connection pool management
//! - Query execution with retry and exponential backoff
//! - Transactions with guaranteed rollback
//! - Retryable error classification
//! - PostgreSQL row and parameter mapping

pub mod classify;
pub mod client;
pub mod credentials;
pub mod executor;
pub mod params;
pub mod pool;
pub mod secrets;
pub mod transaction;
pub mod types;

pub use client::DatabaseClient;
pub use credentials::CredentialResolver;
pub use executor::{MAX_RETRIES, QueryExecutor, Sleeper, TokioSleeper, backoff_delay};
pub use pool::{
    ConnectionPool, PgConnectionPool, PgPoolFactory, PgTransaction, PoolFactory, PoolManager,
    TransactionConnection,
};
pub use secrets::SecretsProvider;
#[cfg(feature = "aws-secrets")]
pub use secrets::AwsSecretsProvider;
pub use transaction::{Transaction, TransactionCoordinator};
