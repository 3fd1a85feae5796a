//! Uniform interface over cache stores.
//!
//! Every store (legacy SQLite, remote document store, in-memory) implements
//! [`CacheBackend`]. Reads return `None` for absent keys rather than an
//! error; writes are upserts keyed by [`CacheKey::storage_id`].

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::model::{CachedResult, SessionState};
use crate::{CacheKey, Error};

pub use memory::MemoryBackend;

/// Keys per sub-batch for batch reads.
pub const BATCH_GET_LIMIT: usize = 100;

/// Result of a batch read: one entry per requested key.
pub type BatchResult = HashMap<CacheKey, Option<CachedResult>>;

/// One row yielded by [`CacheBackend::scan`].
#[derive(Debug)]
pub struct ScanItem {
    /// Storage id as persisted.
    pub id: String,
    /// Decoded record, or the reason it could not be decoded.
    pub record: Result<CachedResult, Error>,
}

/// A page of scanned rows in key order.
#[derive(Debug, Default)]
pub struct ScanPage {
    pub items: Vec<ScanItem>,
    /// Resume point for the next page; `None` once the store is exhausted.
    pub next: Option<String>,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, Error>;

    /// Insert or overwrite the result stored under `key`.
    async fn put(&self, key: &CacheKey, result: &CachedResult) -> Result<(), Error>;

    /// Read many keys at once. Absent keys map to `None`.
    async fn batch_get(&self, keys: &[CacheKey]) -> Result<BatchResult, Error>;

    async fn delete(&self, key: &CacheKey) -> Result<(), Error>;

    /// Remove every stored result. Returns how many were removed.
    async fn clear(&self) -> Result<u64, Error>;

    /// Number of stored results. Approximate for remote stores.
    async fn total_count(&self) -> Result<u64, Error>;

    /// Page through stored results in key order, starting after `after`.
    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<ScanPage, Error>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionState>, Error>;

    async fn put_session(&self, session: &SessionState) -> Result<(), Error>;
}

/// Reject a write whose record does not belong to `key`.
pub fn ensure_key_matches(key: &CacheKey, result: &CachedResult) -> Result<(), Error> {
    if result.url != key.url() || result.session_id.as_deref() != key.session_id() {
        return Err(Error::Validation(format!(
            "record for {} does not match key {}",
            result.url,
            key.storage_id()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_key_matches() {
        let key = CacheKey::new("a.com").unwrap();
        let result = CachedResult::success(&key, 200, "");
        assert!(ensure_key_matches(&key, &result).is_ok());

        let other = CacheKey::new("b.com").unwrap();
        assert!(matches!(ensure_key_matches(&other, &result), Err(Error::Validation(_))));

        let scoped = CacheKey::with_session("a.com", "s1").unwrap();
        assert!(ensure_key_matches(&scoped, &result).is_err());
    }
}
