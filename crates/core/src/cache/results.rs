//! Crawl result CRUD against the legacy `crawled_data` table.
//!
//! Rows keep the legacy layout: JSON-encoded map columns, markdown as plain
//! text or a serialized object, and expiry as epoch seconds. The `url`
//! column holds the storage id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tokio_rusqlite::rusqlite::{self, OptionalExtension, params, params_from_iter};

use super::connection::CacheDb;
use crate::backend::{BATCH_GET_LIMIT, BatchResult, CacheBackend, ScanItem, ScanPage, ensure_key_matches};
use crate::model::{CachedResult, MarkdownVariants, SessionState};
use crate::{CacheKey, Error};

const COLUMNS: &str = "url, html, cleaned_html, markdown, extracted_content, success, status_code,
    media, links, metadata, response_headers, downloaded_files, screenshot, error_message,
    session_id, created_at, updated_at, expires_at";

/// A `crawled_data` row as stored, before JSON columns are parsed.
#[derive(Debug, Clone)]
struct LegacyRow {
    id: String,
    html: String,
    cleaned_html: String,
    markdown: String,
    extracted_content: String,
    success: bool,
    status_code: Option<i64>,
    media: String,
    links: String,
    metadata: String,
    response_headers: String,
    downloaded_files: String,
    screenshot: Option<String>,
    error_message: Option<String>,
    session_id: Option<String>,
    created_at: String,
    updated_at: String,
    expires_at: Option<i64>,
}

impl LegacyRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            html: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            cleaned_html: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            markdown: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            extracted_content: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            success: row.get::<_, Option<i64>>(5)?.unwrap_or(0) != 0,
            status_code: row.get(6)?,
            media: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            links: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            metadata: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            response_headers: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            downloaded_files: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
            screenshot: row.get(12)?,
            error_message: row.get(13)?,
            session_id: row.get(14)?,
            created_at: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
            updated_at: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
            expires_at: row.get(17)?,
        })
    }

    fn from_result(id: String, result: &CachedResult) -> Result<Self, Error> {
        let plain_markdown = MarkdownVariants { raw_markdown: String::new(), ..result.markdown.clone() }.is_empty();
        let markdown = match plain_markdown {
            true => result.markdown.raw_markdown.clone(),
            false => to_json(&id, &result.markdown)?,
        };

        Ok(Self {
            html: result.html.clone(),
            cleaned_html: result.cleaned_html.clone(),
            markdown,
            extracted_content: result.extracted_content.clone(),
            success: result.success,
            status_code: result.status_code.map(i64::from),
            media: to_json(&id, &result.media)?,
            links: to_json(&id, &result.links)?,
            metadata: to_json(&id, &result.metadata)?,
            response_headers: to_json(&id, &result.response_headers)?,
            downloaded_files: to_json(&id, &result.downloaded_files)?,
            screenshot: result.screenshot.clone(),
            error_message: result.error_message.clone(),
            session_id: result.session_id.clone(),
            created_at: result.created_at.to_rfc3339(),
            updated_at: result.updated_at.to_rfc3339(),
            expires_at: result.expires_at.map(|at| at.timestamp()),
            id,
        })
    }

    fn into_result(self) -> Result<CachedResult, Error> {
        let id = self.id;
        let url = id.split_once('#').map_or(id.as_str(), |(url, _)| url).to_string();

        let markdown = match self.markdown.trim_start().starts_with('{') {
            true => match serde_json::from_str::<MarkdownVariants>(&self.markdown) {
                Ok(variants) => variants,
                Err(_) => MarkdownVariants::raw(self.markdown),
            },
            false => MarkdownVariants::raw(self.markdown),
        };

        let status_code = match self.status_code {
            None | Some(0) => None,
            Some(code) => Some(u16::try_from(code).map_err(|_| Error::corrupt(&id, "status_code out of range"))?),
        };

        let expires_at = match self.expires_at {
            None | Some(0) => None,
            Some(secs) => Some(DateTime::from_timestamp(secs, 0).ok_or_else(|| Error::corrupt(&id, "expires_at out of range"))?),
        };

        Ok(CachedResult {
            session_id: self.session_id.filter(|s| !s.is_empty()),
            success: self.success,
            status_code,
            html: self.html,
            cleaned_html: self.cleaned_html,
            markdown,
            extracted_content: self.extracted_content,
            media: parse_map(&id, "media", &self.media)?,
            links: parse_map(&id, "links", &self.links)?,
            metadata: parse_map(&id, "metadata", &self.metadata)?,
            response_headers: parse_json::<BTreeMap<String, String>>(&id, "response_headers", &self.response_headers)?,
            downloaded_files: parse_json::<Vec<String>>(&id, "downloaded_files", &self.downloaded_files)?,
            screenshot: self.screenshot.filter(|s| !s.is_empty()),
            error_message: self.error_message.filter(|s| !s.is_empty()),
            created_at: parse_time(&id, "created_at", &self.created_at)?,
            updated_at: parse_time(&id, "updated_at", &self.updated_at)?,
            expires_at,
            url,
        })
    }
}

fn to_json<T: serde::Serialize>(id: &str, value: &T) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|e| Error::Validation(format!("{id}: {e}")))
}

fn parse_map(id: &str, field: &str, raw: &str) -> Result<Map<String, Value>, Error> {
    parse_json(id, field, raw)
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(id: &str, field: &str, raw: &str) -> Result<T, Error> {
    if raw.trim().is_empty() || raw.trim() == "null" {
        return Ok(T::default());
    }
    serde_json::from_str(raw).map_err(|e| Error::corrupt(id, format!("{field}: {e}")))
}

/// Accepts RFC 3339 and the `YYYY-MM-DD HH:MM:SS` form SQLite writes for
/// `CURRENT_TIMESTAMP`. Empty means unknown.
fn parse_time(id: &str, field: &str, raw: &str) -> Result<DateTime<Utc>, Error> {
    if raw.is_empty() {
        return Ok(DateTime::UNIX_EPOCH);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::corrupt(id, format!("{field}: {e}")))
}

impl CacheDb {
    /// Get a result by storage id.
    ///
    /// Expired rows read as absent.
    pub async fn get_result(&self, key: &CacheKey) -> Result<Option<CachedResult>, Error> {
        let id = key.storage_id();
        let now = Utc::now().timestamp();
        let row = self
            .conn
            .call(move |conn| -> Result<Option<LegacyRow>, Error> {
                let sql = format!(
                    "SELECT {COLUMNS} FROM crawled_data
                     WHERE url = ?1 AND (expires_at IS NULL OR expires_at = 0 OR expires_at > ?2)"
                );
                conn.query_row(&sql, params![id, now], LegacyRow::read)
                    .optional()
                    .map_err(Error::from)
            })
            .await
            .map_err(Error::from)?;

        row.map(LegacyRow::into_result).transpose()
    }

    /// Insert or update a result.
    pub async fn upsert_result(&self, key: &CacheKey, result: &CachedResult) -> Result<(), Error> {
        ensure_key_matches(key, result)?;
        let row = LegacyRow::from_result(key.storage_id(), result)?;

        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    &format!(
                        "INSERT INTO crawled_data ({COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                         ON CONFLICT(url) DO UPDATE SET
                            html = excluded.html,
                            cleaned_html = excluded.cleaned_html,
                            markdown = excluded.markdown,
                            extracted_content = excluded.extracted_content,
                            success = excluded.success,
                            status_code = excluded.status_code,
                            media = excluded.media,
                            links = excluded.links,
                            metadata = excluded.metadata,
                            response_headers = excluded.response_headers,
                            downloaded_files = excluded.downloaded_files,
                            screenshot = excluded.screenshot,
                            error_message = excluded.error_message,
                            session_id = excluded.session_id,
                            updated_at = excluded.updated_at,
                            expires_at = excluded.expires_at"
                    ),
                    params![
                        &row.id,
                        &row.html,
                        &row.cleaned_html,
                        &row.markdown,
                        &row.extracted_content,
                        row.success as i32,
                        &row.status_code,
                        &row.media,
                        &row.links,
                        &row.metadata,
                        &row.response_headers,
                        &row.downloaded_files,
                        &row.screenshot,
                        &row.error_message,
                        &row.session_id,
                        &row.created_at,
                        &row.updated_at,
                        &row.expires_at,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Read many results, querying in chunks of [`BATCH_GET_LIMIT`].
    ///
    /// A row that cannot be decoded is logged and reported as absent.
    pub async fn get_results(&self, keys: &[CacheKey]) -> Result<BatchResult, Error> {
        let mut out: BatchResult = keys.iter().map(|key| (key.clone(), None)).collect();
        let now = Utc::now().timestamp();

        for chunk in keys.chunks(BATCH_GET_LIMIT) {
            let ids: Vec<String> = chunk.iter().map(CacheKey::storage_id).collect();
            let rows = self
                .conn
                .call(move |conn| -> Result<Vec<LegacyRow>, Error> {
                    let placeholders = vec!["?"; ids.len()].join(", ");
                    let sql = format!(
                        "SELECT {COLUMNS} FROM crawled_data
                         WHERE url IN ({placeholders})
                         AND (expires_at IS NULL OR expires_at = 0 OR expires_at > {now})"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params_from_iter(ids.iter()), LegacyRow::read)?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .await
                .map_err(Error::from)?;

            for row in rows {
                let id = row.id.clone();
                let Some(key) = chunk.iter().find(|key| key.storage_id() == id) else {
                    continue;
                };
                match row.into_result() {
                    Ok(result) => {
                        out.insert(key.clone(), Some(result));
                    }
                    Err(e) => tracing::warn!(key = %id, error = %e, "skipping undecodable legacy row"),
                }
            }
        }

        Ok(out)
    }

    /// Delete a result. Deleting an absent key is not an error.
    pub async fn delete_result(&self, key: &CacheKey) -> Result<(), Error> {
        let id = key.storage_id();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute("DELETE FROM crawled_data WHERE url = ?1", params![id])?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Count all stored results, expired or not.
    pub async fn count_results(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM crawled_data", [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Page through results in storage id order, expired rows included.
    pub async fn scan_results(&self, after: Option<&str>, limit: usize) -> Result<ScanPage, Error> {
        let after = after.map(str::to_string);
        let limit = limit.max(1);
        let rows = self
            .conn
            .call(move |conn| -> Result<Vec<LegacyRow>, Error> {
                let sql =
                    format!("SELECT {COLUMNS} FROM crawled_data WHERE (?1 IS NULL OR url > ?1) ORDER BY url LIMIT ?2");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![after, limit as i64], LegacyRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)?;

        let next = (rows.len() == limit).then(|| rows.last().map(|row| row.id.clone())).flatten();
        let items = rows
            .into_iter()
            .map(|row| ScanItem { id: row.id.clone(), record: row.into_result() })
            .collect();

        Ok(ScanPage { items, next })
    }

    /// Delete every result row. Sessions are kept.
    pub async fn clear_results(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let removed = conn.execute("DELETE FROM crawled_data", [])?;
                Ok(removed as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete expired results and sessions. Returns rows removed.
    pub async fn purge_expired(&self) -> Result<usize, Error> {
        let now = Utc::now().timestamp();
        self.conn
            .call(move |conn| -> Result<usize, Error> {
                let results = conn.execute(
                    "DELETE FROM crawled_data WHERE expires_at IS NOT NULL AND expires_at != 0 AND expires_at <= ?1",
                    params![now],
                )?;
                let sessions = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])?;
                Ok(results + sessions)
            })
            .await
            .map_err(Error::from)
    }
}

#[async_trait]
impl CacheBackend for CacheDb {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, Error> {
        self.get_result(key).await
    }

    async fn put(&self, key: &CacheKey, result: &CachedResult) -> Result<(), Error> {
        self.upsert_result(key, result).await
    }

    async fn batch_get(&self, keys: &[CacheKey]) -> Result<BatchResult, Error> {
        self.get_results(keys).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), Error> {
        self.delete_result(key).await
    }

    async fn clear(&self) -> Result<u64, Error> {
        self.clear_results().await
    }

    async fn total_count(&self) -> Result<u64, Error> {
        self.count_results().await
    }

    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<ScanPage, Error> {
        self.scan_results(after, limit).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionState>, Error> {
        self.load_session(session_id).await
    }

    async fn put_session(&self, session: &SessionState) -> Result<(), Error> {
        self.store_session(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(url: &str) -> CacheKey {
        CacheKey::new(url).unwrap()
    }

    fn sample(k: &CacheKey) -> CachedResult {
        let mut result = CachedResult::success(k, 200, "<html><body>hello</body></html>");
        result.markdown = MarkdownVariants::raw("hello");
        result.media.insert("images".into(), serde_json::json!([{"src": "a.png"}]));
        result.response_headers.insert("content-type".into(), "text/html".into());
        result.downloaded_files.push("/tmp/a.pdf".into());
        result
    }

    async fn insert_raw(db: &CacheDb, sql: &'static str) {
        db.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let k = key("a.com");
        let result = sample(&k);

        db.upsert_result(&k, &result).await.unwrap();
        let found = db.get_result(&k).await.unwrap().unwrap();

        assert_eq!(found.url, "https://a.com/");
        assert_eq!(found.html, result.html);
        assert_eq!(found.markdown.raw_markdown, "hello");
        assert_eq!(found.media, result.media);
        assert_eq!(found.response_headers, result.response_headers);
        assert_eq!(found.downloaded_files, result.downloaded_files);
        assert_eq!(found.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let k = key("a.com");
        db.upsert_result(&k, &sample(&k)).await.unwrap();

        let updated = CachedResult::failure(&k, Some(500), "boom");
        db.upsert_result(&k, &updated).await.unwrap();

        let found = db.get_result(&k).await.unwrap().unwrap();
        assert!(!found.success);
        assert_eq!(found.status_code, Some(500));
        assert_eq!(db.count_results().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_markdown_object_round_trip() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let k = key("a.com");
        let mut result = sample(&k);
        result.markdown.fit_markdown = "fit".into();

        db.upsert_result(&k, &result).await.unwrap();
        let found = db.get_result(&k).await.unwrap().unwrap();
        assert_eq!(found.markdown, result.markdown);
    }

    #[tokio::test]
    async fn test_expired_row_reads_absent() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let k = key("a.com");
        let mut result = sample(&k);
        result.expires_at = DateTime::from_timestamp(Utc::now().timestamp() - 60, 0);
        db.upsert_result(&k, &result).await.unwrap();

        assert!(db.get_result(&k).await.unwrap().is_none());
        assert_eq!(db.purge_expired().await.unwrap(), 1);
        assert_eq!(db.count_results().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let db = CacheDb::open_in_memory().await.unwrap();
        assert!(db.get_result(&key("nowhere.com")).await.unwrap().is_none());
        db.delete_result(&key("nowhere.com")).await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_get_spans_chunks() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let keys: Vec<CacheKey> = (0..250).map(|i| key(&format!("site{i}.com"))).collect();
        for k in keys.iter().step_by(2) {
            db.upsert_result(k, &CachedResult::success(k, 200, "")).await.unwrap();
        }

        let found = db.get_results(&keys).await.unwrap();
        assert_eq!(found.len(), 250);
        assert_eq!(found.values().filter(|v| v.is_some()).count(), 125);
        assert!(found[&keys[0]].is_some());
        assert!(found[&keys[1]].is_none());
    }

    #[tokio::test]
    async fn test_session_scoped_keys_are_distinct() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let plain = key("a.com");
        let scoped = CacheKey::with_session("a.com", "s1").unwrap();
        db.upsert_result(&plain, &CachedResult::success(&plain, 200, "plain")).await.unwrap();
        db.upsert_result(&scoped, &CachedResult::success(&scoped, 200, "scoped")).await.unwrap();

        assert_eq!(db.get_result(&plain).await.unwrap().unwrap().html, "plain");
        let found = db.get_result(&scoped).await.unwrap().unwrap();
        assert_eq!(found.html, "scoped");
        assert_eq!(found.session_id.as_deref(), Some("s1"));
        assert_eq!(found.url, "https://a.com/");
    }

    #[tokio::test]
    async fn test_corrupt_json_column() {
        let db = CacheDb::open_in_memory().await.unwrap();
        insert_raw(
            &db,
            "INSERT INTO crawled_data (url, success, media, created_at, updated_at)
             VALUES ('https://bad.com/', 1, '{not json', '2024-01-01 00:00:00', '2024-01-01 00:00:00')",
        )
        .await;

        let err = db.get_result(&key("bad.com")).await.unwrap_err();
        assert!(matches!(err, Error::CorruptDocument { .. }));

        let batch = db.get_results(&[key("bad.com")]).await.unwrap();
        assert!(batch[&key("bad.com")].is_none());
    }

    #[tokio::test]
    async fn test_legacy_plain_row() {
        let db = CacheDb::open_in_memory().await.unwrap();
        insert_raw(
            &db,
            "INSERT INTO crawled_data (url, html, markdown, success, status_code, created_at, updated_at)
             VALUES ('https://old.com/', '<p>old</p>', '# Old', 1, 200, '2024-01-01 10:00:00', '2024-01-01 10:00:00')",
        )
        .await;

        let found = db.get_result(&key("old.com")).await.unwrap().unwrap();
        assert_eq!(found.markdown.raw_markdown, "# Old");
        assert_eq!(found.created_at.timestamp(), 1_704_103_200);
        assert!(found.media.is_empty());
    }

    #[tokio::test]
    async fn test_scan_pages_in_order() {
        let db = CacheDb::open_in_memory().await.unwrap();
        for name in ["c.com", "a.com", "b.com"] {
            let k = key(name);
            db.upsert_result(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        }

        let first = db.scan_results(None, 2).await.unwrap();
        let ids: Vec<_> = first.items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, ["https://a.com/", "https://b.com/"]);

        let second = db.scan_results(first.next.as_deref(), 2).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].id, "https://c.com/");
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_clear_results_keeps_sessions() {
        let db = CacheDb::open_in_memory().await.unwrap();
        for name in ["a.com", "b.com"] {
            let k = key(name);
            db.upsert_result(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        }
        let session = SessionState::new("s1", serde_json::json!({"step": 1}), chrono::Duration::hours(1));
        db.store_session(&session).await.unwrap();

        assert_eq!(db.clear_results().await.unwrap(), 2);
        assert_eq!(db.count_results().await.unwrap(), 0);
        assert!(db.load_session("s1").await.unwrap().is_some());
    }
}
