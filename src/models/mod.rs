//! Data models for the database access layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod credentials;
pub mod query;

// Re-export commonly used types
pub use credentials::{
    CredentialMode, Credentials, DEFAULT_DATABASE, DEFAULT_PORT, LOOPBACK_HOST, SecretBundle,
};
pub use query::{QueryParam, QueryResult};
