//! Cache keys: canonical URL plus optional session id.
//!
//! ### URL Canonicalization
//! - Trim whitespace, default scheme to `https`
//! - Lowercase host, remove fragment
//! - Preserve query string as-is
//!
//! The storage id is the canonical URL, or `{url}#{session}` when a session
//! is attached. Canonical URLs never carry a fragment, so the first `#`
//! always separates the session.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::Error;

/// Identity of a cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    url: String,
    session_id: Option<String>,
}

impl CacheKey {
    /// Build a key from a raw URL, canonicalizing it.
    pub fn new(url: &str) -> Result<Self, Error> {
        Ok(Self { url: canonicalize(url)?, session_id: None })
    }

    /// Build a key scoped to a crawl session.
    pub fn with_session(url: &str, session_id: &str) -> Result<Self, Error> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(Error::Validation("session id must not be empty".into()));
        }
        Ok(Self { url: canonicalize(url)?, session_id: Some(session_id.to_string()) })
    }

    /// Parse a storage id produced by [`CacheKey::storage_id`].
    pub fn from_storage_id(id: &str) -> Result<Self, Error> {
        match id.split_once('#') {
            Some((url, session)) => Self::with_session(url, session),
            None => Self::new(id),
        }
    }

    /// Address a row by its id exactly as persisted, without canonicalizing.
    ///
    /// Legacy rows may predate canonicalization; this key reads them back
    /// but must not be used for writes.
    pub fn persisted(id: &str) -> Result<Self, Error> {
        if id.trim().is_empty() {
            return Err(Error::Validation("empty storage id".into()));
        }
        Ok(Self { url: id.to_string(), session_id: None })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Primary key value used by every backend.
    pub fn storage_id(&self) -> String {
        match &self.session_id {
            Some(session) => format!("{}#{}", self.url, session),
            None => self.url.clone(),
        }
    }

    /// SHA-256 fingerprint of the storage id, hex encoded.
    pub fn fingerprint(&self) -> String {
        hex::encode(digest(&self.storage_id()))
    }

    /// Stable bucket in `0..100` used for percentage routing.
    pub fn bucket(&self) -> u8 {
        bucket_of(&self.storage_id())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_id())
    }
}

/// Stable bucket in `0..100` for an arbitrary identifier.
pub fn bucket_of(id: &str) -> u8 {
    let hash = digest(id);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

fn digest(input: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().into()
}

/// Canonicalize a URL string for consistent keys.
pub fn canonicalize(input: &str) -> Result<String, Error> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(Error::Validation("empty URL".into()));
    }

    let url_str = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };

    let mut parsed = url::Url::parse(&url_str).map_err(|e| Error::Validation(format!("invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(Error::Validation(format!("unsupported scheme: {scheme}"))),
    }

    if let Some(host) = parsed.host_str() {
        let host = host.to_lowercase();
        parsed
            .set_host(Some(&host))
            .map_err(|e| Error::Validation(format!("invalid URL: {e}")))?;
    }

    parsed.set_fragment(None);

    Ok(parsed.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_default_scheme_and_case() {
        assert_eq!(canonicalize("EXAMPLE.com").unwrap(), "https://example.com/");
        assert_eq!(canonicalize("  http://Example.com/a?b=1#frag ").unwrap(), "http://example.com/a?b=1");
    }

    #[test]
    fn test_canonicalize_rejects_bad_input() {
        assert!(matches!(canonicalize(""), Err(Error::Validation(_))));
        assert!(matches!(canonicalize("   "), Err(Error::Validation(_))));
        assert!(matches!(canonicalize("file:///etc/passwd"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_storage_id_round_trip() {
        let plain = CacheKey::new("a.com").unwrap();
        assert_eq!(plain.storage_id(), "https://a.com/");
        assert_eq!(CacheKey::from_storage_id(&plain.storage_id()).unwrap(), plain);

        let scoped = CacheKey::with_session("a.com/page", "sess-1").unwrap();
        assert_eq!(scoped.storage_id(), "https://a.com/page#sess-1");
        assert_eq!(CacheKey::from_storage_id(&scoped.storage_id()).unwrap(), scoped);
        assert_ne!(plain.fingerprint(), scoped.fingerprint());
    }

    #[test]
    fn test_empty_session_rejected() {
        assert!(CacheKey::with_session("a.com", " ").is_err());
    }

    #[test]
    fn test_bucket_is_stable_and_bounded() {
        for i in 0..500 {
            let key = CacheKey::new(&format!("https://site{i}.example/")).unwrap();
            let bucket = key.bucket();
            assert!(bucket < 100);
            assert_eq!(bucket, key.bucket());
            assert_eq!(bucket, bucket_of(&key.storage_id()));
        }
    }

    #[test]
    fn test_fingerprint_format() {
        let key = CacheKey::new("https://example.com").unwrap();
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_persisted_keeps_id_verbatim() {
        let key = CacheKey::persisted("https://A.com").unwrap();
        assert_eq!(key.storage_id(), "https://A.com");
        assert!(CacheKey::persisted("  ").is_err());
    }
}
