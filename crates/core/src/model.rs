//! Cached crawl results and session state.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::CacheKey;

/// Markdown renderings produced for a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkdownVariants {
    #[serde(default)]
    pub raw_markdown: String,
    #[serde(default)]
    pub markdown_with_citations: String,
    #[serde(default)]
    pub references_markdown: String,
    #[serde(default)]
    pub fit_markdown: String,
    #[serde(default)]
    pub fit_html: String,
}

impl MarkdownVariants {
    /// Plain markdown with no derived variants.
    pub fn raw(markdown: impl Into<String>) -> Self {
        Self { raw_markdown: markdown.into(), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.raw_markdown.is_empty()
            && self.markdown_with_citations.is_empty()
            && self.references_markdown.is_empty()
            && self.fit_markdown.is_empty()
            && self.fit_html.is_empty()
    }
}

/// A crawl result as cached by any backend.
///
/// Empty strings and empty maps mean "absent"; optional fields use `None`
/// and never hold an empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub url: String,
    pub session_id: Option<String>,
    pub success: bool,
    pub status_code: Option<u16>,
    pub html: String,
    pub cleaned_html: String,
    pub markdown: MarkdownVariants,
    pub extracted_content: String,
    pub media: Map<String, Value>,
    pub links: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub response_headers: BTreeMap<String, String>,
    pub downloaded_files: Vec<String>,
    pub screenshot: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedResult {
    /// A successful crawl of `key`.
    pub fn success(key: &CacheKey, status_code: u16, html: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            url: key.url().to_string(),
            session_id: key.session_id().map(str::to_string),
            success: true,
            status_code: Some(status_code),
            html: html.into(),
            cleaned_html: String::new(),
            markdown: MarkdownVariants::default(),
            extracted_content: String::new(),
            media: Map::new(),
            links: Map::new(),
            metadata: Map::new(),
            response_headers: BTreeMap::new(),
            downloaded_files: Vec::new(),
            screenshot: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    /// A failed crawl of `key`.
    pub fn failure(key: &CacheKey, status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            html: String::new(),
            error_message: Some(error.into()),
            ..Self::success(key, 0, String::new())
        }
    }

    /// Set the expiration `ttl` after `updated_at`, at whole-second precision.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.expires_at = ttl.and_then(|ttl| {
            let at = self.updated_at + ttl;
            DateTime::from_timestamp(at.timestamp(), 0)
        });
        self
    }

    /// Storage key for this result.
    pub fn key(&self) -> Result<CacheKey, crate::Error> {
        match &self.session_id {
            Some(session) => CacheKey::with_session(&self.url, session),
            None => CacheKey::new(&self.url),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Fields compared by shadow reads and migration verification.
    pub fn significant_mismatch(&self, other: &CachedResult) -> Option<&'static str> {
        if self.url != other.url {
            Some("url")
        } else if self.success != other.success {
            Some("success")
        } else if self.status_code != other.status_code {
            Some("status_code")
        } else {
            None
        }
    }
}

/// Opaque per-session crawler state with an idle expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub state: Value,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionState {
    /// Fresh state touched now, expiring after `idle`.
    pub fn new(session_id: impl Into<String>, state: Value, idle: Duration) -> Self {
        let now = Utc::now();
        let expires_at = DateTime::from_timestamp((now + idle).timestamp(), 0).unwrap_or(now + idle);
        Self { session_id: session_id.into(), state, updated_at: now, expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
