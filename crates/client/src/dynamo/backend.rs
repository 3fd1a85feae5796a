//! Remote cache backend over DynamoDB tables.
//!
//! Results live in one table keyed by `url` (the storage id), sessions in
//! another keyed by `session_id`. Documents are produced by the [`Codec`]
//! and mapped onto attribute values by [`super::item`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use crawlstore_core::backend::{BATCH_GET_LIMIT, ensure_key_matches};
use crawlstore_core::codec::{RESULT_KEY, SESSION_KEY};
use crawlstore_core::{
    AppConfig, BatchResult, CacheBackend, CacheKey, CachedResult, Codec, Document, Error, ReadConsistency, ScanItem,
    ScanPage, SessionState,
};
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value, json};

use super::{DynamoClient, DynamoConfig, item};

const BACKEND: &str = "dynamodb";

/// Sub-batches of a batch read issued concurrently.
const BATCH_FAN_OUT: usize = 4;

/// [`CacheBackend`] backed by DynamoDB.
#[derive(Debug, Clone)]
pub struct DynamoBackend {
    client: DynamoClient,
    codec: Codec,
    results_table: String,
    sessions_table: String,
    consistent_read: bool,
}

impl DynamoBackend {
    pub fn new(
        client: DynamoClient, codec: Codec, results_table: impl Into<String>, sessions_table: impl Into<String>,
    ) -> Self {
        Self {
            client,
            codec,
            results_table: results_table.into(),
            sessions_table: sessions_table.into(),
            consistent_read: false,
        }
    }

    pub fn with_read_consistency(mut self, consistency: ReadConsistency) -> Self {
        self.consistent_read = consistency == ReadConsistency::Strong;
        self
    }

    /// Build the adapter from application configuration.
    ///
    /// # Errors
    ///
    /// Fails when no credentials can be resolved or the endpoint is invalid.
    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        let client = DynamoConfig::from_app_config(config)
            .and_then(DynamoClient::new)
            .map_err(|e| e.into_cache_error(BACKEND))?;

        tracing::info!(
            region = %config.region,
            endpoint = config.endpoint_url.as_deref().unwrap_or("aws"),
            results_table = %config.results_table,
            sessions_table = %config.sessions_table,
            "remote backend configured"
        );

        Ok(Self::new(client, Codec::from_config(config), &config.results_table, &config.sessions_table)
            .with_read_consistency(config.read_consistency))
    }

    pub fn results_table(&self) -> &str {
        &self.results_table
    }

    /// Issue `operation`, retrying transient failures.
    async fn request(&self, operation: &str, body: Value) -> Result<Value, Error> {
        self.client
            .retry_policy()
            .run(BACKEND, operation, || self.client.call(operation, &body))
            .await
    }

    async fn delete_id(&self, id: &str) -> Result<(), Error> {
        let body = json!({
            "TableName": self.results_table,
            "Key": key_attribute(RESULT_KEY, id),
        });
        self.request("DeleteItem", body).await?;
        Ok(())
    }

    /// One page of primary keys only.
    async fn scan_ids(&self, after: Option<&str>) -> Result<(Vec<String>, Option<String>), Error> {
        let mut body = json!({
            "TableName": self.results_table,
            "ProjectionExpression": "#id",
            "ExpressionAttributeNames": { "#id": RESULT_KEY },
        });
        if let Some(after) = after {
            body["ExclusiveStartKey"] = key_attribute(RESULT_KEY, after);
        }
        let response = self.request("Scan", body).await?;

        let ids = response
            .get("Items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_object).map(|a| item_id(a, RESULT_KEY)).collect())
            .unwrap_or_default();
        let next = response
            .get("LastEvaluatedKey")
            .and_then(Value::as_object)
            .map(|last| item_id(last, RESULT_KEY));
        Ok((ids, next))
    }

    fn decode_result(&self, attributes: &Map<String, Value>) -> Result<CachedResult, Error> {
        let map = item::from_item(attributes)
            .map_err(|e| Error::CorruptDocument { key: item_id(attributes, RESULT_KEY), reason: e.to_string() })?;
        self.codec.decode(&Document::from_map(map))
    }

    /// Read one sub-batch, re-requesting only the keys the service leaves
    /// unprocessed.
    async fn batch_get_chunk(&self, keys: Vec<Value>) -> Result<Vec<(String, CachedResult)>, Error> {
        let retry = self.client.retry_policy();
        let mut pending = keys;
        let mut found = Vec::with_capacity(pending.len());
        let mut attempt = 0;

        loop {
            attempt += 1;
            let body = json!({
                "RequestItems": {
                    &self.results_table: { "Keys": pending, "ConsistentRead": self.consistent_read }
                }
            });
            let response = self.request("BatchGetItem", body).await?;

            let items = response
                .get("Responses")
                .and_then(|r| r.get(&self.results_table))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for attributes in items.iter().filter_map(Value::as_object) {
                match self.decode_result(attributes) {
                    Ok(result) => found.push((item_id(attributes, RESULT_KEY), result)),
                    Err(e) => {
                        tracing::warn!(key = %item_id(attributes, RESULT_KEY), error = %e, "skipping undecodable item");
                    }
                }
            }

            let unprocessed: Vec<Value> = response
                .get("UnprocessedKeys")
                .and_then(|u| u.get(&self.results_table))
                .and_then(|t| t.get("Keys"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if unprocessed.is_empty() {
                return Ok(found);
            }

            if attempt >= retry.max_attempts {
                tracing::warn!(remaining = unprocessed.len(), attempts = attempt, "unprocessed keys left after retries");
                return Err(Error::BackendUnavailable {
                    backend: BACKEND.into(),
                    reason: format!("BatchGetItem left {} keys unprocessed after {attempt} attempts", unprocessed.len()),
                });
            }

            let delay = retry.delay_for_attempt(attempt);
            tracing::debug!(
                remaining = unprocessed.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying unprocessed keys"
            );
            tokio::time::sleep(delay).await;
            pending = unprocessed;
        }
    }
}

fn key_attribute(name: &str, id: &str) -> Value {
    json!({ name: { "S": id } })
}

/// Primary key of a raw item, for logs and errors.
fn item_id(attributes: &Map<String, Value>, name: &str) -> String {
    attributes
        .get(name)
        .and_then(|a| a.get("S"))
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string()
}

#[async_trait]
impl CacheBackend for DynamoBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, Error> {
        let body = json!({
            "TableName": self.results_table,
            "Key": key_attribute(RESULT_KEY, &key.storage_id()),
            "ConsistentRead": self.consistent_read,
        });
        let response = self.request("GetItem", body).await?;

        let Some(attributes) = response.get("Item").and_then(Value::as_object) else {
            return Ok(None);
        };
        let result = self.decode_result(attributes)?;
        Ok((!result.is_expired(Utc::now())).then_some(result))
    }

    async fn put(&self, key: &CacheKey, result: &CachedResult) -> Result<(), Error> {
        ensure_key_matches(key, result)?;
        let encoded = self.codec.encode(result);
        let size = encoded.document.size_bytes();
        if size > self.codec.max_item_bytes() {
            return Err(Error::Validation(format!(
                "{key}: document is {size} bytes, limit {}",
                self.codec.max_item_bytes()
            )));
        }

        let body = json!({
            "TableName": self.results_table,
            "Item": item::to_item(encoded.document.as_map()),
        });
        self.request("PutItem", body).await?;
        tracing::debug!(key = %key, size, truncated = encoded.truncated.len(), "stored remote item");
        Ok(())
    }

    async fn batch_get(&self, keys: &[CacheKey]) -> Result<BatchResult, Error> {
        let mut out = BatchResult::with_capacity(keys.len());
        let mut seen = HashSet::with_capacity(keys.len());
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.storage_id();
            if seen.insert(id.clone()) {
                ids.push(id);
            }
            out.insert(key.clone(), None);
        }

        let chunks: Vec<Vec<Value>> = ids
            .chunks(BATCH_GET_LIMIT)
            .map(|chunk| chunk.iter().map(|id| key_attribute(RESULT_KEY, id)).collect())
            .collect();
        let pages: Vec<Result<Vec<(String, CachedResult)>, Error>> = stream::iter(chunks)
            .map(|chunk| self.batch_get_chunk(chunk))
            .buffer_unordered(BATCH_FAN_OUT)
            .collect()
            .await;

        let now = Utc::now();
        let mut by_id = HashMap::new();
        for page in pages {
            for (id, result) in page? {
                if !result.is_expired(now) {
                    by_id.insert(id, result);
                }
            }
        }
        for (key, slot) in out.iter_mut() {
            *slot = by_id.get(&key.storage_id()).cloned();
        }
        Ok(out)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), Error> {
        self.delete_id(&key.storage_id()).await
    }

    /// Scans key pages and deletes item by item; the table itself is kept.
    async fn clear(&self) -> Result<u64, Error> {
        let mut removed = 0;
        let mut after = None;
        loop {
            let (ids, next) = self.scan_ids(after.as_deref()).await?;
            let outcomes: Vec<Result<(), Error>> = stream::iter(ids)
                .map(|id| async move { self.delete_id(&id).await })
                .buffer_unordered(BATCH_FAN_OUT)
                .collect()
                .await;
            for outcome in outcomes {
                outcome?;
                removed += 1;
            }

            match next {
                Some(last) => after = Some(last),
                None => break,
            }
        }
        tracing::info!(table = %self.results_table, removed, "cleared remote results");
        Ok(removed)
    }

    /// `ItemCount` from `DescribeTable`; refreshed by the service roughly every six hours.
    async fn total_count(&self) -> Result<u64, Error> {
        let response = self.request("DescribeTable", json!({ "TableName": self.results_table })).await?;
        response
            .get("Table")
            .and_then(|t| t.get("ItemCount"))
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Remote(format!("DescribeTable for {} has no ItemCount", self.results_table)))
    }

    /// Pages follow the table's scan order, resuming from `LastEvaluatedKey`.
    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<ScanPage, Error> {
        let mut body = json!({
            "TableName": self.results_table,
            "Limit": limit,
            "ConsistentRead": self.consistent_read,
        });
        if let Some(after) = after {
            body["ExclusiveStartKey"] = key_attribute(RESULT_KEY, after);
        }
        let response = self.request("Scan", body).await?;

        let items = response
            .get("Items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(|attributes| ScanItem {
                        id: item_id(attributes, RESULT_KEY),
                        record: self.decode_result(attributes),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let next = response
            .get("LastEvaluatedKey")
            .and_then(Value::as_object)
            .map(|last| item_id(last, RESULT_KEY));

        Ok(ScanPage { items, next })
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionState>, Error> {
        let body = json!({
            "TableName": self.sessions_table,
            "Key": key_attribute(SESSION_KEY, session_id),
            "ConsistentRead": self.consistent_read,
        });
        let response = self.request("GetItem", body).await?;

        let Some(attributes) = response.get("Item").and_then(Value::as_object) else {
            return Ok(None);
        };
        let map = item::from_item(attributes)
            .map_err(|e| Error::CorruptDocument { key: session_id.to_string(), reason: e.to_string() })?;
        let session = self.codec.decode_session(&Document::from_map(map))?;
        Ok((!session.is_expired(Utc::now())).then_some(session))
    }

    async fn put_session(&self, session: &SessionState) -> Result<(), Error> {
        if session.session_id.trim().is_empty() {
            return Err(Error::Validation("session id must not be empty".into()));
        }
        let document = self.codec.encode_session(session);
        let body = json!({
            "TableName": self.sessions_table,
            "Item": item::to_item(document.as_map()),
        });
        self.request("PutItem", body).await?;
        Ok(())
    }
}
