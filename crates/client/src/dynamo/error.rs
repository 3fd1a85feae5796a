//! DynamoDB client error types.

use std::sync::Arc;

use crawlstore_core::Error;

/// Errors from the DynamoDB JSON protocol client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DynamoError {
    /// Service error parsed from the response body's `__type`.
    #[error("{kind} ({status}): {message}")]
    Service { kind: String, status: u16, message: String },

    /// Non-2xx response without a parseable service error.
    #[error("HTTP error: {status}")]
    HttpError { status: u16 },

    /// Request timeout.
    #[error("request timeout")]
    Timeout,

    /// Network error.
    #[error("network error: {0}")]
    Network(Arc<reqwest::Error>),

    /// Response parse error.
    #[error("parse error: {0}")]
    Parse(String),

    /// Request could not be signed.
    #[error("signing error: {0}")]
    Signing(String),

    /// No credentials could be resolved.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// Invalid client configuration (endpoint URL, region).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for DynamoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() { DynamoError::Timeout } else { DynamoError::Network(Arc::new(err)) }
    }
}

impl DynamoError {
    /// Build a service error from a response status and its JSON body.
    ///
    /// The `__type` field looks like `com.amazonaws.dynamodb.v20120810#ResourceNotFoundException`;
    /// only the part after `#` is kept.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
            return DynamoError::HttpError { status };
        };
        let Some(kind) = value.get("__type").and_then(|t| t.as_str()) else {
            return DynamoError::HttpError { status };
        };
        let kind = kind.rsplit_once('#').map_or(kind, |(_, kind)| kind).to_string();
        let message = value
            .get("message")
            .or_else(|| value.get("Message"))
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        DynamoError::Service { kind, status, message }
    }

    /// Throughput or request-rate limiting.
    pub fn is_throttling(&self) -> bool {
        match self {
            DynamoError::Service { kind, .. } => matches!(
                kind.as_str(),
                "ProvisionedThroughputExceededException"
                    | "ThrottlingException"
                    | "RequestLimitExceeded"
                    | "LimitExceededException"
            ),
            DynamoError::HttpError { status } => *status == 429,
            _ => false,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        if self.is_throttling() {
            return true;
        }
        match self {
            DynamoError::Service { kind, status, .. } => {
                *status >= 500
                    || matches!(
                        kind.as_str(),
                        "InternalServerError" | "ServiceUnavailable" | "TransactionInProgressException"
                    )
            }
            DynamoError::HttpError { status } => *status >= 500,
            DynamoError::Timeout | DynamoError::Network(_) => true,
            DynamoError::Parse(_)
            | DynamoError::Signing(_)
            | DynamoError::MissingCredentials(_)
            | DynamoError::Config(_) => false,
        }
    }

    /// Translate into the cache taxonomy once retries are settled.
    pub fn into_cache_error(self, backend: &str) -> Error {
        match &self {
            _ if self.is_throttling() => Error::Throttled(self.to_string()),
            DynamoError::Service { kind, .. } if kind == "ValidationException" || kind == "SerializationException" => {
                Error::Validation(self.to_string())
            }
            _ if self.is_retryable() => Error::BackendUnavailable { backend: backend.to_string(), reason: self.to_string() },
            _ => Error::Remote(self.to_string()),
        }
    }
}
