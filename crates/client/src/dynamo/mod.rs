//! DynamoDB JSON protocol client.
//!
//! Speaks `DynamoDB_20120810` over HTTPS with SigV4-signed POST requests.
//!
//! ### Protocol
//!
//! - **Endpoint**: `https://dynamodb.{region}.amazonaws.com`, or any
//!   compatible endpoint (local emulators) via `endpoint_url`.
//! - **Authentication**: SigV4 with explicit credentials, the ambient
//!   `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY`/`AWS_SESSION_TOKEN`
//!   variables, or dummy credentials when a custom endpoint is set.
//! - **Concurrency**: at most `max_pool_connections` requests in flight.
//! - **Timeouts**: every call carries a per-request timeout; a timeout is
//!   retryable.

pub mod backend;
pub mod error;
pub mod item;
pub mod retry;
pub mod sigv4;

pub use backend::DynamoBackend;
pub use error::DynamoError;
pub use retry::RetryPolicy;
pub use sigv4::{Credentials, RequestSigner};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crawlstore_core::AppConfig;
use reqwest::header;
use serde_json::Value;
use tokio::sync::Semaphore;

/// Protocol version prefix for the `X-Amz-Target` header.
const TARGET_PREFIX: &str = "DynamoDB_20120810";

/// Default user agent.
const DEFAULT_USER_AGENT: &str = "crawlstore/0.1";

/// DynamoDB client configuration.
#[derive(Debug, Clone)]
pub struct DynamoConfig {
    pub endpoint: url::Url,
    pub region: String,
    pub credentials: Credentials,
    /// Per-request timeout.
    pub timeout: Duration,
    pub max_connections: usize,
    pub retry: RetryPolicy,
}

impl DynamoConfig {
    /// Build from application configuration, resolving credentials.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, DynamoError> {
        let endpoint = match &config.endpoint_url {
            Some(url) => url::Url::parse(url).map_err(|e| DynamoError::Config(format!("endpoint_url: {e}")))?,
            None => url::Url::parse(&format!("https://dynamodb.{}.amazonaws.com", config.region))
                .map_err(|e| DynamoError::Config(format!("region: {e}")))?,
        };

        Ok(Self {
            credentials: resolve_credentials(config)?,
            endpoint,
            region: config.region.clone(),
            timeout: config.request_timeout(),
            max_connections: config.max_pool_connections,
            retry: RetryPolicy::new(config.max_retries, Duration::from_millis(config.retry_base_delay_ms)),
        })
    }
}

/// Credentials from config, then the ambient `AWS_*` variables, then dummy
/// values accepted by local emulators when a custom endpoint is configured.
fn resolve_credentials(config: &AppConfig) -> Result<Credentials, DynamoError> {
    if let Some((id, secret)) = config.explicit_credentials() {
        return Ok(Credentials {
            access_key_id: id.to_string(),
            secret_access_key: secret.to_string(),
            session_token: config.session_token.clone(),
        });
    }

    if let (Ok(id), Ok(secret)) = (std::env::var("AWS_ACCESS_KEY_ID"), std::env::var("AWS_SECRET_ACCESS_KEY")) {
        return Ok(Credentials {
            access_key_id: id,
            secret_access_key: secret,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        });
    }

    if config.endpoint_url.is_some() {
        tracing::debug!("no credentials configured; using dummy credentials for custom endpoint");
        return Ok(Credentials {
            access_key_id: "local".into(),
            secret_access_key: "local".into(),
            session_token: None,
        });
    }

    Err(DynamoError::MissingCredentials(
        "set access_key_id/secret_access_key or AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY".into(),
    ))
}

/// DynamoDB API client.
#[derive(Debug, Clone)]
pub struct DynamoClient {
    http: reqwest::Client,
    endpoint: url::Url,
    host: String,
    signer: RequestSigner,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl DynamoClient {
    /// Create a new client with the given configuration.
    pub fn new(config: DynamoConfig) -> Result<Self, DynamoError> {
        let host = match (config.endpoint.host_str(), config.endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(DynamoError::Config(format!("endpoint {} has no host", config.endpoint))),
        };

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_connections)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| DynamoError::Network(Arc::new(e)))?;

        Ok(Self {
            http,
            host,
            endpoint: config.endpoint,
            signer: RequestSigner::new(config.credentials, config.region),
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            retry: config.retry,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Issue a single API call without retrying.
    ///
    /// `operation` is the action name, e.g. `GetItem`.
    pub async fn call(&self, operation: &str, body: &Value) -> Result<Value, DynamoError> {
        let payload = serde_json::to_vec(body).map_err(|e| DynamoError::Parse(e.to_string()))?;
        let target = format!("{TARGET_PREFIX}.{operation}");

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| DynamoError::Config(format!("connection pool closed: {e}")))?;

        let signed = self.signer.sign(&self.host, &target, &payload, Utc::now())?;

        tracing::debug!(operation, bytes = payload.len(), "dynamodb request");

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(header::CONTENT_TYPE, sigv4::CONTENT_TYPE)
            .header("X-Amz-Target", &target)
            .header("X-Amz-Date", &signed.amz_date)
            .header(header::AUTHORIZATION, &signed.authorization);
        if let Some(token) = &signed.security_token {
            request = request.header("X-Amz-Security-Token", token);
        }

        let response = request.body(payload).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let err = DynamoError::from_response(status.as_u16(), &bytes);
            tracing::debug!(operation, status = status.as_u16(), error = %err, "dynamodb error response");
            return Err(err);
        }

        serde_json::from_slice(&bytes).map_err(|e| DynamoError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint_from_region() {
        let config = AppConfig {
            region: "eu-west-1".into(),
            access_key_id: Some("AKID".into()),
            secret_access_key: Some("secret".into()),
            ..Default::default()
        };
        let dynamo = DynamoConfig::from_app_config(&config).unwrap();
        assert_eq!(dynamo.endpoint.as_str(), "https://dynamodb.eu-west-1.amazonaws.com/");
        assert_eq!(dynamo.credentials.access_key_id, "AKID");
        assert_eq!(dynamo.retry.max_attempts, 5);

        let client = DynamoClient::new(dynamo).unwrap();
        assert_eq!(client.host, "dynamodb.eu-west-1.amazonaws.com");
    }

    #[test]
    fn test_local_endpoint_keeps_port() {
        let config = AppConfig { endpoint_url: Some("http://localhost:8000".into()), ..Default::default() };
        let client = DynamoClient::new(DynamoConfig::from_app_config(&config).unwrap()).unwrap();
        assert_eq!(client.host, "localhost:8000");
    }

    #[test]
    fn test_invalid_endpoint() {
        let config = AppConfig { endpoint_url: Some("not a url".into()), ..Default::default() };
        assert!(matches!(DynamoConfig::from_app_config(&config), Err(DynamoError::Config(_))));
    }
}
