//! Credential resolution.
//!
//! Connection parameters come from one of three places, checked in a fixed order:
//!
//! 1. **Tunnel** - a local port-forward. Triggered by `DB_USE_TUNNEL`, by a
//!    loopback `DB_HOST`, or by `DB_FORCE_DIRECT` together with `APP_ENV=test`.
//!    The host is always pinned to loopback and `DB_USER`/`DB_PASSWORD` are
//!    mandatory.
//! 2. **Direct** - `DB_USER`, `DB_PASSWORD` and `DB_HOST` are all set.
//! 3. **Managed** - a JSON bundle fetched from the secrets store by
//!    `DB_SECRET_ARN`, bounded by a hard timeout.
//!
//! The first successful resolution is memoized. A failed resolution caches
//! nothing; the error goes straight back to the caller.

use crate::config::{DEFAULT_SECRET_TIMEOUT_MS, EnvSource, env_keys};
use crate::db::secrets::SecretsProvider;
use crate::error::{DbError, DbResult};
use crate::models::{
    CredentialMode, Credentials, DEFAULT_DATABASE, DEFAULT_PORT, LOOPBACK_HOST, SecretBundle,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Returns true for `localhost` and any loopback IP literal.
pub fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

/// Resolves and memoizes database credentials.
pub struct CredentialResolver {
    env: Arc<dyn EnvSource>,
    secrets: Option<Arc<dyn SecretsProvider>>,
    secret_timeout: Duration,
    cached: OnceCell<Credentials>,
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("has_secrets_provider", &self.secrets.is_some())
            .field("secret_timeout", &self.secret_timeout)
            .field("resolved", &self.cached.initialized())
            .finish()
    }
}

impl CredentialResolver {
    /// Create a resolver reading from `env`, with no secrets store.
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            env,
            secrets: None,
            secret_timeout: Duration::from_millis(DEFAULT_SECRET_TIMEOUT_MS),
            cached: OnceCell::new(),
        }
    }

    /// Use `provider` for managed-mode lookups.
    pub fn with_secrets(mut self, provider: Arc<dyn SecretsProvider>) -> Self {
        self.secrets = Some(provider);
        self
    }

    /// Override the secrets fetch timeout.
    pub fn with_secret_timeout(mut self, timeout: Duration) -> Self {
        self.secret_timeout = timeout;
        self
    }

    /// Credentials from a previous successful resolution, if any.
    pub fn cached(&self) -> Option<&Credentials> {
        self.cached.get()
    }

    /// Which mode the current environment selects. Does not touch the secrets store.
    pub fn mode(&self) -> CredentialMode {
        let env = self.env.as_ref();
        let loopback_host = env.var(env_keys::HOST).is_some_and(|h| is_loopback(&h));
        let forced_in_tests = env.flag(env_keys::FORCE_DIRECT)
            && env
                .var(env_keys::APP_ENV)
                .is_some_and(|v| v.eq_ignore_ascii_case(env_keys::TEST_ENV));

        if env.flag(env_keys::USE_TUNNEL) || loopback_host || forced_in_tests {
            return CredentialMode::Tunnel;
        }

        let direct = [env_keys::USER, env_keys::PASSWORD, env_keys::HOST]
            .iter()
            .all(|key| env.var(key).is_some());
        if direct {
            CredentialMode::Direct
        } else {
            CredentialMode::Managed
        }
    }

    /// Resolve credentials, reusing the first successful result.
    pub async fn resolve(&self) -> DbResult<Credentials> {
        self.cached
            .get_or_try_init(|| self.resolve_uncached())
            .await
            .cloned()
    }

    async fn resolve_uncached(&self) -> DbResult<Credentials> {
        let mode = self.mode();
        let credentials = match mode {
            CredentialMode::Tunnel => self.tunnel()?,
            CredentialMode::Direct => self.direct()?,
            CredentialMode::Managed => self.managed().await?,
        };

        info!(
            mode = %credentials.mode,
            host = %credentials.host,
            port = credentials.port,
            database = %credentials.database,
            require_tls = credentials.require_tls,
            "Resolved database credentials"
        );
        Ok(credentials)
    }

    fn tunnel(&self) -> DbResult<Credentials> {
        let env = self.env.as_ref();
        let username = env.var(env_keys::USER);
        let password = env.var(env_keys::PASSWORD);

        let (Some(username), Some(password)) = (username, password) else {
            let missing: Vec<&str> = [env_keys::USER, env_keys::PASSWORD]
                .into_iter()
                .filter(|key| env.var(key).is_none())
                .collect();
            return Err(DbError::configuration(format!(
                "Tunnel mode requires {} to be set",
                missing.join(" and ")
            )));
        };

        if let Some(host) = env.var(env_keys::HOST).filter(|h| !is_loopback(h)) {
            debug!(configured_host = %host, "Ignoring DB_HOST in tunnel mode");
        }

        Ok(Credentials {
            host: LOOPBACK_HOST.to_string(),
            port: self.port()?,
            database: self.database_name(),
            username,
            password,
            require_tls: env.flag(env_keys::SSL),
            mode: CredentialMode::Tunnel,
        })
    }

    fn direct(&self) -> DbResult<Credentials> {
        let env = self.env.as_ref();
        let required = |key: &str| {
            env.var(key)
                .ok_or_else(|| DbError::configuration(format!("{} is not set", key)))
        };

        Ok(Credentials {
            host: required(env_keys::HOST)?,
            port: self.port()?,
            database: self.database_name(),
            username: required(env_keys::USER)?,
            password: required(env_keys::PASSWORD)?,
            require_tls: env.flag(env_keys::SSL),
            mode: CredentialMode::Direct,
        })
    }

    async fn managed(&self) -> DbResult<Credentials> {
        let secret_id = self.env.var(env_keys::SECRET_ARN).ok_or_else(|| {
            DbError::configuration(format!(
                "{} is not set and no direct or tunnel credentials were provided",
                env_keys::SECRET_ARN
            ))
        })?;

        let provider = self.secrets.as_ref().ok_or_else(|| {
            DbError::configuration("Managed credentials requested but no secrets provider is configured")
        })?;

        debug!(secret_id = %secret_id, timeout_ms = self.secret_timeout.as_millis() as u64, "Fetching credentials from secrets store");

        let raw = match tokio::time::timeout(self.secret_timeout, provider.get_secret(&secret_id))
            .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(secret_id = %secret_id, error = %e, "Secrets store lookup failed");
                return Err(e);
            }
            Err(_) => {
                warn!(secret_id = %secret_id, "Secrets store lookup timed out");
                return Err(DbError::timeout(format!(
                    "secret fetch exceeded {}ms",
                    self.secret_timeout.as_millis()
                )));
            }
        };

        let bundle = SecretBundle::from_json(&raw)
            .map_err(|e| DbError::secrets(&secret_id, format!("malformed secret: {}", e)))?;

        Ok(Credentials {
            host: bundle.host,
            port: bundle.port.unwrap_or(DEFAULT_PORT),
            database: bundle
                .dbname
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| self.database_name()),
            username: bundle.username,
            password: bundle.password,
            require_tls: true,
            mode: CredentialMode::Managed,
        })
    }

    fn port(&self) -> DbResult<u16> {
        match self.env.var(env_keys::PORT) {
            None => Ok(DEFAULT_PORT),
            Some(raw) => raw.parse().map_err(|_| {
                DbError::configuration(format!("{} is not a valid port: {}", env_keys::PORT, raw))
            }),
        }
    }

    fn database_name(&self) -> String {
        self.env
            .var(env_keys::NAME)
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string())
    }
}
