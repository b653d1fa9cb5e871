//! resilient-pg - Main entry point.
//!
//! Runs SQL statements through the resilient access layer: a single statement
//! goes through the retrying executor, several statements run in one transaction.

use clap::Parser;
use resilient_pg::config::Config;
use resilient_pg::db::{DatabaseClient, SecretsProvider};
use resilient_pg::models::{QueryParam, QueryResult};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Parse a `--param` value: JSON when it parses, plain text otherwise.
fn parse_param(raw: &str) -> QueryParam {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(QueryParam::from)
        .unwrap_or_else(|_| QueryParam::String(raw.to_string()))
}

#[cfg(feature = "aws-secrets")]
async fn secrets_provider() -> Option<Arc<dyn SecretsProvider>> {
    Some(Arc::new(resilient_pg::db::AwsSecretsProvider::from_env().await))
}

#[cfg(not(feature = "aws-secrets"))]
async fn secrets_provider() -> Option<Arc<dyn SecretsProvider>> {
    None
}

async fn run(client: &DatabaseClient, config: &Config) -> resilient_pg::DbResult<Vec<QueryResult>> {
    let credentials = client.credentials().await?;
    info!(
        mode = %credentials.mode,
        endpoint = %credentials.endpoint(),
        database = %credentials.database,
        "Using database"
    );

    let params: Vec<QueryParam> = config.params.iter().map(|p| parse_param(p)).collect();

    if let [sql] = config.statements.as_slice() {
        let result = match config.deadline_duration() {
            Some(deadline) => client.execute_query_within(sql, &params, deadline).await?,
            None => client.execute_query(sql, &params).await?,
        };
        return Ok(vec![result]);
    }

    let statements = config.statements.clone();
    client
        .execute_transaction(move |tx| {
            Box::pin(async move {
                let mut results = Vec::with_capacity(statements.len());
                for (idx, sql) in statements.iter().enumerate() {
                    let bound: &[QueryParam] = if idx == 0 { &params } else { &[] };
                    results.push(tx.execute(sql, bound).await?);
                }
                Ok(results)
            })
        })
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let options = config.pool_options();
    if let Err(e) = options.validate() {
        error!(error = %e, "Invalid pool configuration");
        return Err(e.into());
    }

    info!(
        statements = config.statements.len(),
        "Starting resilient-pg v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = DatabaseClient::from_env(
        options,
        secrets_provider().await,
        config.secret_timeout_duration(),
    );

    let outcome = run(&client, &config).await;
    client.close().await;

    match outcome {
        Ok(results) => {
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Database operation failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param_json_and_text() {
        assert_eq!(parse_param("42"), QueryParam::Int(42));
        assert_eq!(parse_param("true"), QueryParam::Bool(true));
        assert_eq!(parse_param("\"quoted\""), QueryParam::String("quoted".into()));
        assert_eq!(parse_param("plain text"), QueryParam::String("plain text".into()));
        assert_eq!(parse_param("null"), QueryParam::Null);
    }
}
