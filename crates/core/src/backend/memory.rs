//! In-process document store.
//!
//! Stores codec-encoded documents, so size limits and truncation behave as
//! they do against the remote store. Useful for local runs and tests; it
//! also counts writes and can be switched to an unavailable state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{BatchResult, CacheBackend, ScanItem, ScanPage, ensure_key_matches};
use crate::codec::{Codec, Document};
use crate::model::{CachedResult, SessionState};
use crate::{CacheKey, Error};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    codec: Codec,
    results: RwLock<BTreeMap<String, Document>>,
    sessions: RwLock<BTreeMap<String, Document>>,
    writes: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new(codec: Codec) -> Self {
        Self { codec, ..Default::default() }
    }

    /// Number of successful result and session writes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with `BackendUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Raw stored document, for inspecting truncation.
    pub async fn document(&self, key: &CacheKey) -> Option<Document> {
        self.results.read().await.get(&key.storage_id()).cloned()
    }

    fn check(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable { backend: self.name().into(), reason: "marked unavailable".into() });
        }
        Ok(())
    }

    fn live(&self, document: &Document) -> Result<Option<CachedResult>, Error> {
        let result = self.codec.decode(document)?;
        Ok((!result.is_expired(Utc::now())).then_some(result))
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, Error> {
        self.check()?;
        match self.results.read().await.get(&key.storage_id()) {
            Some(document) => self.live(document),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &CacheKey, result: &CachedResult) -> Result<(), Error> {
        self.check()?;
        ensure_key_matches(key, result)?;
        let encoded = self.codec.encode(result);
        self.results.write().await.insert(key.storage_id(), encoded.document);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn batch_get(&self, keys: &[CacheKey]) -> Result<BatchResult, Error> {
        self.check()?;
        let results = self.results.read().await;
        let mut out = BatchResult::with_capacity(keys.len());
        for key in keys {
            let found = match results.get(&key.storage_id()).map(|document| self.live(document)) {
                Some(Ok(found)) => found,
                Some(Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "skipping undecodable document");
                    None
                }
                None => None,
            };
            out.insert(key.clone(), found);
        }
        Ok(out)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), Error> {
        self.check()?;
        self.results.write().await.remove(&key.storage_id());
        Ok(())
    }

    async fn clear(&self) -> Result<u64, Error> {
        self.check()?;
        let mut results = self.results.write().await;
        let removed = results.len() as u64;
        results.clear();
        Ok(removed)
    }

    async fn total_count(&self) -> Result<u64, Error> {
        self.check()?;
        Ok(self.results.read().await.len() as u64)
    }

    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<ScanPage, Error> {
        self.check()?;
        let results = self.results.read().await;
        let start = match after {
            Some(after) => std::ops::Bound::Excluded(after.to_string()),
            None => std::ops::Bound::Unbounded,
        };

        let items: Vec<ScanItem> = results
            .range((start, std::ops::Bound::Unbounded))
            .take(limit)
            .map(|(id, document)| ScanItem { id: id.clone(), record: self.codec.decode(document) })
            .collect();

        let next = (items.len() == limit).then(|| items.last().map(|item| item.id.clone())).flatten();
        Ok(ScanPage { items, next })
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionState>, Error> {
        self.check()?;
        match self.sessions.read().await.get(session_id) {
            Some(document) => {
                let session = self.codec.decode_session(document)?;
                Ok((!session.is_expired(Utc::now())).then_some(session))
            }
            None => Ok(None),
        }
    }

    async fn put_session(&self, session: &SessionState) -> Result<(), Error> {
        self.check()?;
        let document = self.codec.encode_session(session);
        self.sessions.write().await.insert(session.session_id.clone(), document);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
