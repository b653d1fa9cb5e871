//! Resilient PostgreSQL access layer.
//!
//! This library resolves database credentials (tunnel, direct or secrets store),
//! manages a single lazily created connection pool, retries transient query
//! failures with exponential backoff and runs units of work inside transactions
//! that always end in COMMIT or ROLLBACK.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::DatabaseClient;
pub use error::{DbError, DbResult};
pub use models::{QueryParam, QueryResult};
