//! Size-bounded document encoding for cached results.
//!
//! Encoding is total: absent values become empty strings, zero, or empty
//! maps, because the remote store rejects nulls on indexed paths. Any text
//! field longer than the per-field threshold is cut and suffixed with
//! [`TRUNCATION_MARKER`]; if the whole document still exceeds the item
//! ceiling, the largest text fields shrink further, then the largest maps
//! are emptied. Every lossy step is listed in `truncated_fields`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{CachedResult, MarkdownVariants, SessionState};
use crate::Error;

/// Appended to every truncated text field.
pub const TRUNCATION_MARKER: &str = "\n[...truncated]";

/// Primary key attribute of result documents.
pub const RESULT_KEY: &str = "url";

/// Primary key attribute of session documents.
pub const SESSION_KEY: &str = "session_id";

const TRUNCATED_FIELDS: &str = "truncated_fields";

/// A wire-compatible JSON object as persisted by a document store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Value of the primary key attribute, if present.
    pub fn key(&self) -> Option<&str> {
        self.0.get(RESULT_KEY).and_then(Value::as_str)
    }

    /// Serialized size in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.0).map_or(0, |bytes| bytes.len())
    }

    /// Fields that lost fidelity when this document was encoded.
    pub fn truncated_fields(&self) -> Vec<String> {
        self.0
            .get(TRUNCATED_FIELDS)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Output of [`Codec::encode`].
#[derive(Debug, Clone)]
pub struct Encoded {
    pub document: Document,
    /// Dotted paths of fields that were truncated or emptied.
    pub truncated: Vec<String>,
}

impl Encoded {
    pub fn is_degraded(&self) -> bool {
        !self.truncated.is_empty()
    }
}

/// Size limits applied during encoding.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_item_bytes: usize,
    max_field_bytes: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(400 * 1024, 100 * 1024)
    }
}

impl Codec {
    pub fn new(max_item_bytes: usize, max_field_bytes: usize) -> Self {
        Self { max_item_bytes, max_field_bytes }
    }

    pub fn from_config(config: &crate::AppConfig) -> Self {
        Self::new(config.max_item_bytes, config.max_field_bytes)
    }

    pub fn max_item_bytes(&self) -> usize {
        self.max_item_bytes
    }

    /// Encode a result into a document within the configured limits.
    pub fn encode(&self, result: &CachedResult) -> Encoded {
        let mut record = result.clone();
        let mut truncated = Vec::new();

        for (name, field) in text_fields(&mut record) {
            if field.len() > self.max_field_bytes {
                truncate_with_marker(field, self.max_field_bytes);
                truncated.push(name.to_string());
            }
        }

        loop {
            let map = to_map(&record, &truncated);
            let size = serde_json::to_vec(&map).map_or(0, |bytes| bytes.len());
            if size <= self.max_item_bytes {
                if !truncated.is_empty() {
                    tracing::debug!(url = %record.url, fields = ?truncated, size, "document truncated to fit");
                }
                return Encoded { document: Document(map), truncated };
            }

            let excess = size - self.max_item_bytes;
            if shrink_largest_text(&mut record, excess, &mut truncated) || clear_largest_map(&mut record, &mut truncated) {
                continue;
            }

            tracing::warn!(url = %record.url, size, limit = self.max_item_bytes, "document exceeds item ceiling after truncation");
            return Encoded { document: Document(map), truncated };
        }
    }

    /// Decode a result document.
    ///
    /// # Errors
    ///
    /// Returns `Error::CorruptDocument` if the key is missing or a field has
    /// the wrong type.
    pub fn decode(&self, document: &Document) -> Result<CachedResult, Error> {
        let map = &document.0;
        let storage_id = match map.get(RESULT_KEY) {
            Some(Value::String(s)) if !s.is_empty() => s.as_str(),
            _ => return Err(Error::corrupt("<unknown>", "missing url key")),
        };
        let url = storage_id.split_once('#').map_or(storage_id, |(url, _)| url);
        let fields = Fields { key: storage_id, map };

        let markdown = match map.get("markdown") {
            None | Some(Value::Null) => MarkdownVariants::default(),
            Some(Value::String(raw)) => MarkdownVariants::raw(raw.clone()),
            Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
                .map_err(|e| Error::corrupt(storage_id, format!("markdown: {e}")))?,
            Some(_) => return Err(Error::corrupt(storage_id, "markdown: unexpected type")),
        };

        let status_code = match fields.number("status_code")? {
            0 => None,
            code => Some(u16::try_from(code).map_err(|_| Error::corrupt(storage_id, "status_code out of range"))?),
        };

        let response_headers = match map.get("response_headers") {
            None | Some(Value::Null) => Default::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::corrupt(storage_id, format!("response_headers: {e}")))?,
        };

        let downloaded_files = match map.get("downloaded_files") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::corrupt(storage_id, format!("downloaded_files: {e}")))?,
        };

        let expires_at = match fields.number("ttl")? {
            0 => None,
            secs => Some(
                DateTime::from_timestamp(secs, 0).ok_or_else(|| Error::corrupt(storage_id, "ttl out of range"))?,
            ),
        };

        Ok(CachedResult {
            url: url.to_string(),
            session_id: fields.optional_string("session_id")?,
            success: fields.boolean("success")?,
            status_code,
            html: fields.string("html")?,
            cleaned_html: fields.string("cleaned_html")?,
            markdown,
            extracted_content: fields.string("extracted_content")?,
            media: fields.object("media")?,
            links: fields.object("links")?,
            metadata: fields.object("metadata")?,
            response_headers,
            downloaded_files,
            screenshot: fields.optional_string("screenshot")?,
            error_message: fields.optional_string("error_message")?,
            created_at: fields.timestamp("created_at")?,
            updated_at: fields.timestamp("updated_at")?,
            expires_at,
        })
    }

    /// Encode session state.
    pub fn encode_session(&self, session: &SessionState) -> Document {
        let mut map = Map::new();
        map.insert(SESSION_KEY.into(), Value::String(session.session_id.clone()));
        map.insert("state".into(), session.state.clone());
        map.insert("updated_at".into(), Value::String(format_time(session.updated_at)));
        map.insert("ttl".into(), Value::from(session.expires_at.timestamp()));
        Document(map)
    }

    /// Decode session state.
    ///
    /// # Errors
    ///
    /// Returns `Error::CorruptDocument` if the session id is missing or a
    /// timestamp is malformed.
    pub fn decode_session(&self, document: &Document) -> Result<SessionState, Error> {
        let map = &document.0;
        let session_id = match map.get(SESSION_KEY) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(Error::corrupt("<unknown>", "missing session_id key")),
        };
        let fields = Fields { key: &session_id, map };
        let expires_at = DateTime::from_timestamp(fields.number("ttl")?, 0)
            .ok_or_else(|| Error::corrupt(&session_id, "ttl out of range"))?;

        Ok(SessionState {
            state: map.get("state").cloned().unwrap_or(Value::Null),
            updated_at: fields.timestamp("updated_at")?,
            expires_at,
            session_id: session_id.clone(),
        })
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn storage_id(record: &CachedResult) -> String {
    match &record.session_id {
        Some(session) => format!("{}#{}", record.url, session),
        None => record.url.clone(),
    }
}

fn to_map(record: &CachedResult, truncated: &[String]) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(RESULT_KEY.into(), Value::String(storage_id(record)));
    map.insert("success".into(), Value::Bool(record.success));
    map.insert("status_code".into(), Value::from(record.status_code.unwrap_or(0)));
    map.insert("html".into(), Value::String(record.html.clone()));
    map.insert("cleaned_html".into(), Value::String(record.cleaned_html.clone()));
    map.insert(
        "markdown".into(),
        serde_json::to_value(&record.markdown).unwrap_or_else(|_| Value::Object(Map::new())),
    );
    map.insert("extracted_content".into(), Value::String(record.extracted_content.clone()));
    map.insert("media".into(), Value::Object(record.media.clone()));
    map.insert("links".into(), Value::Object(record.links.clone()));
    map.insert("metadata".into(), Value::Object(record.metadata.clone()));
    map.insert(
        "response_headers".into(),
        Value::Object(
            record
                .response_headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ),
    );
    map.insert(
        "downloaded_files".into(),
        Value::Array(record.downloaded_files.iter().cloned().map(Value::String).collect()),
    );
    map.insert("screenshot".into(), Value::String(record.screenshot.clone().unwrap_or_default()));
    map.insert("error_message".into(), Value::String(record.error_message.clone().unwrap_or_default()));
    map.insert("session_id".into(), Value::String(record.session_id.clone().unwrap_or_default()));
    map.insert("created_at".into(), Value::String(format_time(record.created_at)));
    map.insert("updated_at".into(), Value::String(format_time(record.updated_at)));
    map.insert("ttl".into(), Value::from(record.expires_at.map_or(0, |at| at.timestamp())));
    map.insert(
        TRUNCATED_FIELDS.into(),
        Value::Array(truncated.iter().cloned().map(Value::String).collect()),
    );
    map
}

fn text_fields(record: &mut CachedResult) -> Vec<(&'static str, &mut String)> {
    let mut fields = vec![
        ("html", &mut record.html),
        ("cleaned_html", &mut record.cleaned_html),
        ("extracted_content", &mut record.extracted_content),
        ("markdown.raw_markdown", &mut record.markdown.raw_markdown),
        ("markdown.markdown_with_citations", &mut record.markdown.markdown_with_citations),
        ("markdown.references_markdown", &mut record.markdown.references_markdown),
        ("markdown.fit_markdown", &mut record.markdown.fit_markdown),
        ("markdown.fit_html", &mut record.markdown.fit_html),
    ];
    if let Some(screenshot) = record.screenshot.as_mut() {
        fields.push(("screenshot", screenshot));
    }
    if let Some(error) = record.error_message.as_mut() {
        fields.push(("error_message", error));
    }
    fields
}

/// Cut `field` so that content plus marker fits in `limit` bytes.
fn truncate_with_marker(field: &mut String, limit: usize) {
    let mut end = limit.saturating_sub(TRUNCATION_MARKER.len()).min(field.len());
    while !field.is_char_boundary(end) {
        end -= 1;
    }
    field.truncate(end);
    field.push_str(TRUNCATION_MARKER);
}

fn mark(truncated: &mut Vec<String>, name: &str) {
    if !truncated.iter().any(|f| f == name) {
        truncated.push(name.to_string());
    }
}

fn shrink_largest_text(record: &mut CachedResult, excess: usize, truncated: &mut Vec<String>) -> bool {
    let largest = text_fields(record)
        .into_iter()
        .filter(|(_, field)| field.len() > TRUNCATION_MARKER.len())
        .max_by_key(|(_, field)| field.len());

    match largest {
        Some((name, field)) => {
            let target = field.len().saturating_sub(excess.max(1));
            truncate_with_marker(field, target.max(TRUNCATION_MARKER.len()));
            mark(truncated, name);
            true
        }
        None => false,
    }
}

fn clear_largest_map(record: &mut CachedResult, truncated: &mut Vec<String>) -> bool {
    let size = |map: &Map<String, Value>| serde_json::to_vec(map).map_or(0, |bytes| bytes.len());
    let mut maps = [
        ("media", &mut record.media),
        ("links", &mut record.links),
        ("metadata", &mut record.metadata),
    ];
    maps.sort_by_key(|(_, map)| std::cmp::Reverse(size(map)));

    let [(name, map), ..] = maps;
    if map.is_empty() {
        return false;
    }
    map.clear();
    mark(truncated, name);
    true
}

struct Fields<'a> {
    key: &'a str,
    map: &'a Map<String, Value>,
}

impl Fields<'_> {
    fn string(&self, name: &str) -> Result<String, Error> {
        match self.map.get(name) {
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(Error::corrupt(self.key, format!("{name}: expected string"))),
        }
    }

    fn optional_string(&self, name: &str) -> Result<Option<String>, Error> {
        self.string(name).map(|s| (!s.is_empty()).then_some(s))
    }

    fn boolean(&self, name: &str) -> Result<bool, Error> {
        match self.map.get(name) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(Error::corrupt(self.key, format!("{name}: expected bool"))),
        }
    }

    fn number(&self, name: &str) -> Result<i64, Error> {
        match self.map.get(name) {
            None | Some(Value::Null) => Ok(0),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| Error::corrupt(self.key, format!("{name}: expected integer"))),
            Some(_) => Err(Error::corrupt(self.key, format!("{name}: expected number"))),
        }
    }

    fn object(&self, name: &str) -> Result<Map<String, Value>, Error> {
        match self.map.get(name) {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(_) => Err(Error::corrupt(self.key, format!("{name}: expected object"))),
        }
    }

    fn timestamp(&self, name: &str) -> Result<DateTime<Utc>, Error> {
        match self.map.get(name) {
            None | Some(Value::Null) => Ok(DateTime::<Utc>::UNIX_EPOCH),
            Some(Value::String(s)) if s.is_empty() => Ok(DateTime::<Utc>::UNIX_EPOCH),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| Error::corrupt(self.key, format!("{name}: {e}"))),
            Some(_) => Err(Error::corrupt(self.key, format!("{name}: expected timestamp"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheKey;
    use serde_json::json;

    fn sample() -> CachedResult {
        let key = CacheKey::new("https://example.com/page").unwrap();
        let mut result = CachedResult::success(&key, 200, "<html><body>hi</body></html>")
            .with_ttl(Some(chrono::Duration::days(1)));
        result.cleaned_html = "<body>hi</body>".into();
        result.markdown = MarkdownVariants { raw_markdown: "hi".into(), fit_markdown: "hi".into(), ..Default::default() };
        result.metadata.insert("title".into(), json!("Example"));
        result.links.insert("internal".into(), json!([{"href": "/a"}]));
        result.response_headers.insert("content-type".into(), "text/html".into());
        result.downloaded_files.push("report.pdf".into());
        result
    }

    #[test]
    fn test_round_trip() {
        let codec = Codec::default();
        let result = sample();
        let encoded = codec.encode(&result);
        assert!(!encoded.is_degraded());
        assert_eq!(codec.decode(&encoded.document).unwrap(), result);
    }

    #[test]
    fn test_round_trip_failure_with_session() {
        let codec = Codec::default();
        let key = CacheKey::with_session("b.com", "s-1").unwrap();
        let result = CachedResult::failure(&key, Some(404), "not found");
        let encoded = codec.encode(&result);
        assert_eq!(encoded.document.key(), Some("https://b.com/#s-1"));
        assert_eq!(codec.decode(&encoded.document).unwrap(), result);
    }

    #[test]
    fn test_absent_values_normalized() {
        let codec = Codec::default();
        let key = CacheKey::new("a.com").unwrap();
        let mut result = CachedResult::success(&key, 200, "");
        result.status_code = None;
        let doc = codec.encode(&result).document;
        let map = doc.as_map();
        assert_eq!(map["status_code"], json!(0));
        assert_eq!(map["screenshot"], json!(""));
        assert_eq!(map["media"], json!({}));
        assert_eq!(map["ttl"], json!(0));
        assert!(map.values().all(|v| !v.is_null()));
    }

    #[test]
    fn test_oversized_field_truncated_with_marker() {
        let codec = Codec::new(400 * 1024, 100 * 1024);
        let mut result = sample();
        result.html = "x".repeat(500 * 1024);

        let encoded = codec.encode(&result);
        assert_eq!(encoded.truncated, vec!["html".to_string()]);
        assert_eq!(encoded.document.truncated_fields(), vec!["html".to_string()]);
        assert!(encoded.document.size_bytes() <= 400 * 1024);

        let decoded = codec.decode(&encoded.document).unwrap();
        assert!(decoded.html.ends_with(TRUNCATION_MARKER));
        assert!(decoded.html.len() <= 100 * 1024);
        assert_eq!(decoded.cleaned_html, result.cleaned_html);
        assert_eq!(decoded.markdown, result.markdown);
    }

    #[test]
    fn test_item_ceiling_shrinks_largest_fields() {
        let codec = Codec::new(10_000, 6_000);
        let mut result = sample();
        result.html = "a".repeat(5_000);
        result.cleaned_html = "b".repeat(5_000);
        result.extracted_content = "c".repeat(5_000);

        let encoded = codec.encode(&result);
        assert!(encoded.document.size_bytes() <= 10_000);
        assert!(encoded.is_degraded());
        let decoded = codec.decode(&encoded.document).unwrap();
        assert!(decoded.html.len() + decoded.cleaned_html.len() + decoded.extracted_content.len() < 10_000);
    }

    #[test]
    fn test_maps_cleared_as_last_resort() {
        let codec = Codec::new(2_000, 1_000);
        let mut result = sample();
        for i in 0..200 {
            result.metadata.insert(format!("k{i}"), json!(i));
        }
        let encoded = codec.encode(&result);
        assert!(encoded.truncated.contains(&"metadata".to_string()));
        assert!(codec.decode(&encoded.document).unwrap().metadata.is_empty());
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut field = "é".repeat(100);
        truncate_with_marker(&mut field, 51 + TRUNCATION_MARKER.len());
        assert!(field.ends_with(TRUNCATION_MARKER));
        assert_eq!(field.len(), 50 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_decode_missing_key() {
        let codec = Codec::default();
        let doc = Document::from_map(json!({"success": true}).as_object().unwrap().clone());
        assert!(matches!(codec.decode(&doc), Err(Error::CorruptDocument { .. })));
    }

    #[test]
    fn test_decode_wrong_type() {
        let codec = Codec::default();
        let doc = Document::from_map(json!({"url": "https://a.com/", "success": "yes"}).as_object().unwrap().clone());
        assert!(matches!(codec.decode(&doc), Err(Error::CorruptDocument { .. })));
    }

    #[test]
    fn test_decode_plain_markdown() {
        let codec = Codec::default();
        let doc = Document::from_map(json!({"url": "https://a.com/", "markdown": "# Title"}).as_object().unwrap().clone());
        let decoded = codec.decode(&doc).unwrap();
        assert_eq!(decoded.markdown.raw_markdown, "# Title");
        assert_eq!(decoded.status_code, None);
    }

    #[test]
    fn test_session_round_trip() {
        let codec = Codec::default();
        let session = SessionState::new("s-1", json!({"step": 3}), chrono::Duration::minutes(5));
        let doc = codec.encode_session(&session);
        assert_eq!(codec.decode_session(&doc).unwrap(), session);
    }
}
