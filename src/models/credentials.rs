//! Connection credential models.
//!
//! This module defines the resolved connection parameters and the secret bundle
//! format read from the secrets store.

use serde::{Deserialize, Deserializer, Serialize};

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 5432;

/// Database name used when none is configured.
pub const DEFAULT_DATABASE: &str = "postgres";

/// Host every tunnel-mode connection is pinned to.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// How the credentials were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
    /// Local port-forward to the database
    Tunnel,
    /// Explicit environment variables
    Direct,
    /// Secrets-store lookup
    Managed,
}

impl std::fmt::Display for CredentialMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tunnel => write!(f, "tunnel"),
            Self::Direct => write!(f, "direct"),
            Self::Managed => write!(f, "managed"),
        }
    }
}

/// Resolved connection parameters. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    /// Contains sensitive data - never log
    pub password: String,
    pub require_tls: bool,
    pub mode: CredentialMode,
}

impl Credentials {
    /// Host and port in `host:port` form.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"****")
            .field("require_tls", &self.require_tls)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Secret bundle stored in the secrets manager (JSON).
#[derive(Clone, Deserialize)]
pub struct SecretBundle {
    pub username: String,
    pub password: String,
    pub host: String,
    #[serde(default, deserialize_with = "port_from_number_or_string")]
    pub port: Option<u16>,
    #[serde(default)]
    pub dbname: Option<String>,
}

impl SecretBundle {
    /// Parse a bundle from the raw secret string.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl std::fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBundle")
            .field("username", &self.username)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .finish_non_exhaustive()
    }
}

/// Secrets managers store the port either as a number or as a string.
fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match Option::<PortValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortValue::Number(port)) => Ok(Some(port)),
        Some(PortValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(PortValue::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {text}"))),
    }
}
