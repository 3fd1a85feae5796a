//! Unified error types for crawlstore.
//!
//! Backend adapters translate their native failures into these variants at
//! their boundary, so callers never see SQLite or wire-level error shapes.

use tokio_rusqlite::rusqlite;

/// Unified error type for cache, routing and migration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed key or document. Never retried.
    #[error("VALIDATION_ERROR: {0}")]
    Validation(String),

    /// A stored document could not be decoded.
    #[error("CORRUPT_DOCUMENT: {key}: {reason}")]
    CorruptDocument { key: String, reason: String },

    /// The backend is rate limiting us.
    #[error("THROTTLED: {0}")]
    Throttled(String),

    /// Retries were exhausted or the backend cannot be reached.
    #[error("BACKEND_UNAVAILABLE: {backend}: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Shadow read or verification found diverging fields.
    #[error("CONSISTENCY_ERROR: {key}: {field} differs")]
    Consistency { key: String, field: String },

    /// Non-retryable remote failure that is not a validation problem
    /// (bad credentials, missing table).
    #[error("BACKEND_ERROR: {0}")]
    Remote(String),

    /// Legacy database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Legacy schema migration failed to apply.
    #[error("CACHE_ERROR: schema migration failed: {0}")]
    SchemaMigration(String),

    /// Cursor or file I/O failed.
    #[error("IO_ERROR: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the operation that produced this error may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Throttled(_) | Error::BackendUnavailable { .. })
    }

    pub(crate) fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Error::CorruptDocument { key: key.into(), reason: reason.to_string() }
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CorruptDocument { key: "https://a.com/".into(), reason: "missing url".into() };
        assert!(err.to_string().starts_with("CORRUPT_DOCUMENT"));
        assert!(err.to_string().contains("missing url"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::Throttled("slow down".into()).is_retryable());
        assert!(Error::BackendUnavailable { backend: "dynamodb".into(), reason: "timeout".into() }.is_retryable());
        assert!(!Error::Validation("empty url".into()).is_retryable());
        assert!(!Error::Remote("bad credentials".into()).is_retryable());
        assert!(!Error::corrupt("k", "bad json").is_retryable());
    }
}
