//! Configuration handling.
//!
//! Process-level settings (logging, pool sizing, TLS verification) come from CLI
//! arguments and environment variables through `clap`. Credential inputs are
//! looked up at resolution time through [`EnvSource`] so they can be swapped for
//! a fixed map in tests.

use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Hard bound on a single secrets-store fetch.
pub const DEFAULT_SECRET_TIMEOUT_MS: u64 = 5_000;

/// Environment keys read by the credential resolver.
pub mod env_keys {
    pub const HOST: &str = "DB_HOST";
    pub const PORT: &str = "DB_PORT";
    pub const USER: &str = "DB_USER";
    pub const PASSWORD: &str = "DB_PASSWORD";
    pub const NAME: &str = "DB_NAME";
    pub const SSL: &str = "DB_SSL";
    pub const USE_TUNNEL: &str = "DB_USE_TUNNEL";
    pub const FORCE_DIRECT: &str = "DB_FORCE_DIRECT";
    pub const APP_ENV: &str = "APP_ENV";
    pub const SECRET_ARN: &str = "DB_SECRET_ARN";

    /// Value of `APP_ENV` that marks a test run.
    pub const TEST_ENV: &str = "test";
}

/// Key/value lookup for environment configuration.
pub trait EnvSource: Send + Sync {
    /// Raw value for `key`, if set.
    fn get(&self, key: &str) -> Option<String>;

    /// Value for `key` with surrounding whitespace removed; blank counts as unset.
    fn var(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Interpret `key` as a boolean flag. Unset or unrecognized values are false.
    fn flag(&self, key: &str) -> bool {
        self.var(key).is_some_and(|v| {
            v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes")
        })
    }
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Connection pool configuration options.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Idle timeout in seconds (default: 30)
    pub idle_timeout_secs: Option<u64>,
    /// Connection acquire timeout in seconds (default: 5)
    pub acquire_timeout_secs: Option<u64>,
    /// Keep no warm connections so an idle process can exit (default: false)
    pub allow_exit_on_idle: Option<bool>,
    /// Verify the server certificate chain and host name (default: false)
    pub tls_verify: Option<bool>,
}

impl PoolOptions {
    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get min_connections with default value. Zero when exit-on-idle is allowed.
    pub fn min_connections_or_default(&self) -> u32 {
        if self.allow_exit_on_idle_or_default() {
            return 0;
        }
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    /// Get idle_timeout with default value.
    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }

    /// Get allow_exit_on_idle with default value.
    pub fn allow_exit_on_idle_or_default(&self) -> bool {
        self.allow_exit_on_idle.unwrap_or(false)
    }

    /// Get tls_verify with default value.
    pub fn tls_verify_or_default(&self) -> bool {
        self.tls_verify.unwrap_or(false)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            let max = self.max_connections_or_default();
            if min > max {
                return Err(format!(
                    "min_connections ({}) cannot exceed max_connections ({})",
                    min, max
                ));
            }
        }
        if self.acquire_timeout_secs == Some(0) {
            return Err("acquire_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Command-line configuration for the `resilient-pg` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "resilient-pg")]
#[command(author, version, about = "Run statements through the resilient PostgreSQL access layer")]
pub struct Config {
    /// SQL statement to run. Repeat to run several statements in one transaction.
    #[arg(long = "sql", required = true)]
    pub statements: Vec<String>,

    /// Positional parameter for the first statement (JSON value, or plain text)
    #[arg(long = "param")]
    pub params: Vec<String>,

    /// Maximum connections in the pool
    #[arg(long, env = "DB_POOL_MAX")]
    pub max_connections: Option<u32>,

    /// Minimum connections in the pool
    #[arg(long, env = "DB_POOL_MIN")]
    pub min_connections: Option<u32>,

    /// Idle connection timeout in seconds
    #[arg(long, env = "DB_POOL_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Connection acquire timeout in seconds
    #[arg(long, env = "DB_POOL_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: Option<u64>,

    /// Hold no idle connections so the process may exit when idle
    #[arg(long, env = "DB_POOL_ALLOW_EXIT_ON_IDLE")]
    pub allow_exit_on_idle: bool,

    /// Verify the database server certificate (disabled by default for managed endpoints)
    #[arg(long, env = "DB_TLS_VERIFY")]
    pub tls_verify: bool,

    /// Timeout for a secrets-store fetch in milliseconds
    #[arg(long, env = "DB_SECRET_TIMEOUT_MS", default_value_t = DEFAULT_SECRET_TIMEOUT_MS)]
    pub secret_timeout_ms: u64,

    /// Deadline for the whole query including retries, in milliseconds
    #[arg(long)]
    pub deadline_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Pool options assembled from the CLI flags.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            idle_timeout_secs: self.idle_timeout,
            acquire_timeout_secs: self.acquire_timeout,
            allow_exit_on_idle: Some(self.allow_exit_on_idle),
            tls_verify: Some(self.tls_verify),
        }
    }

    pub fn secret_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.secret_timeout_ms)
    }

    pub fn deadline_duration(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}
