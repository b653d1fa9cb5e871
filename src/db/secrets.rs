//! Secrets-store access.
//!
//! The resolver only needs one operation from a secrets manager: fetch the raw
//! secret string for an identifier. The core bounds that call with its own
//! timeout, so implementations do not need to.

use crate::error::DbResult;
use async_trait::async_trait;

/// A store that returns the raw secret string for an identifier (e.g. an ARN).
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn get_secret(&self, secret_id: &str) -> DbResult<String>;
}

#[cfg(feature = "aws-secrets")]
pub use aws::AwsSecretsProvider;

#[cfg(feature = "aws-secrets")]
mod aws {
    use super::*;
    use crate::error::DbError;
    use tracing::debug;

    /// AWS Secrets Manager client using the default credential chain.
    #[derive(Debug, Clone)]
    pub struct AwsSecretsProvider {
        client: aws_sdk_secretsmanager::Client,
    }

    impl AwsSecretsProvider {
        /// Build a client from the ambient AWS configuration (env, profile, IMDS).
        pub async fn from_env() -> Self {
            let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Self {
                client: aws_sdk_secretsmanager::Client::new(&config),
            }
        }

        pub fn new(client: aws_sdk_secretsmanager::Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl SecretsProvider for AwsSecretsProvider {
        async fn get_secret(&self, secret_id: &str) -> DbResult<String> {
            debug!(secret_id = %secret_id, "Fetching database secret");
            let output = self
                .client
                .get_secret_value()
                .secret_id(secret_id)
                .send()
                .await
                .map_err(|e| DbError::secrets(secret_id, e.to_string()))?;

            output
                .secret_string()
                .map(str::to_owned)
                .ok_or_else(|| DbError::secrets(secret_id, "secret has no string value"))
        }
    }
}
