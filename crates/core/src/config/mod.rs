//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (CRAWLSTORE_*)
//! 2. TOML config file (if CRAWLSTORE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Read consistency requested from the remote store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadConsistency {
    Strong,
    #[default]
    Eventual,
}

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (CRAWLSTORE_*)
/// 2. TOML config file (if CRAWLSTORE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote document store endpoint, e.g. `http://localhost:8000` for a
    /// local emulator. The regional AWS endpoint is used when unset.
    ///
    /// Set via CRAWLSTORE_ENDPOINT_URL environment variable.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Set via CRAWLSTORE_REGION environment variable.
    #[serde(default = "default_region")]
    pub region: String,

    /// Explicit credential pair. Falls back to the ambient `AWS_*` variables.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,

    /// Path to the legacy SQLite cache.
    ///
    /// Set via CRAWLSTORE_LEGACY_DB_PATH environment variable.
    #[serde(default = "default_legacy_db_path")]
    pub legacy_db_path: PathBuf,

    #[serde(default = "default_results_table")]
    pub results_table: String,

    #[serde(default = "default_sessions_table")]
    pub sessions_table: String,

    /// Share of keys (0-100), by stable hash, routed to the remote store.
    ///
    /// Set via CRAWLSTORE_MIGRATION_PERCENTAGE environment variable.
    #[serde(default)]
    pub migration_percentage: u8,

    /// Route everything to the legacy store (rollback).
    #[serde(default)]
    pub force_legacy: bool,

    /// Route everything to the remote store.
    #[serde(default)]
    pub force_remote: bool,

    /// Mirror writes to the non-routed backend.
    #[serde(default)]
    pub dual_write: bool,

    /// Read both backends and compare, answering from the routed one.
    #[serde(default)]
    pub shadow_read: bool,

    /// On a miss, also check the backend the key is not routed to.
    #[serde(default)]
    pub fallback_on_miss: bool,

    /// Attempt ceiling for retryable remote failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum concurrent in-flight requests to the remote store.
    #[serde(default = "default_max_pool_connections")]
    pub max_pool_connections: usize,

    #[serde(default)]
    pub read_consistency: ReadConsistency,

    /// Per-call timeout for remote requests in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Ceiling for one serialized document.
    #[serde(default = "default_max_item_bytes")]
    pub max_item_bytes: usize,

    /// Threshold above which a single string field is truncated.
    #[serde(default = "default_max_field_bytes")]
    pub max_field_bytes: usize,

    /// Passive expiration window for cached results. Zero disables expiry.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Idle window after which a session expires.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,

    #[serde(default)]
    pub migration: MigrationSettings,
}

/// Settings for the migration tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Failed/processed ratio above which the migration is aborted.
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,

    /// Rows scanned before the failure rate may abort a run early. The
    /// rate is always checked once the scan finishes.
    #[serde(default = "default_min_scanned_for_abort")]
    pub min_scanned_for_abort: u64,

    /// Matched/sampled ratio required to reach `Complete`.
    #[serde(default = "default_min_verification_rate")]
    pub min_verification_rate: f64,

    /// Concurrent writes per batch.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_cursor_path")]
    pub cursor_path: PathBuf,
}

fn default_region() -> String {
    "us-east-1".into()
}

fn default_legacy_db_path() -> PathBuf {
    PathBuf::from("./.crawl4ai/cache.db")
}

fn default_results_table() -> String {
    "crawl4ai-results".into()
}

fn default_sessions_table() -> String {
    "crawl4ai-sessions".into()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

fn default_max_pool_connections() -> usize {
    50
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_item_bytes() -> usize {
    400 * 1024
}

fn default_max_field_bytes() -> usize {
    100 * 1024
}

fn default_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_session_idle_secs() -> u64 {
    3_600
}

fn default_batch_size() -> usize {
    25
}

fn default_sample_size() -> usize {
    10
}

fn default_max_failure_rate() -> f64 {
    0.05
}

fn default_min_scanned_for_abort() -> u64 {
    100
}

fn default_min_verification_rate() -> f64 {
    0.95
}

fn default_max_in_flight() -> usize {
    8
}

fn default_cursor_path() -> PathBuf {
    PathBuf::from("./.crawl4ai/migration-cursor.json")
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sample_size: default_sample_size(),
            max_failure_rate: default_max_failure_rate(),
            min_scanned_for_abort: default_min_scanned_for_abort(),
            min_verification_rate: default_min_verification_rate(),
            max_in_flight: default_max_in_flight(),
            cursor_path: default_cursor_path(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            region: default_region(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            legacy_db_path: default_legacy_db_path(),
            results_table: default_results_table(),
            sessions_table: default_sessions_table(),
            migration_percentage: 0,
            force_legacy: false,
            force_remote: false,
            dual_write: false,
            shadow_read: false,
            fallback_on_miss: false,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_pool_connections: default_max_pool_connections(),
            read_consistency: ReadConsistency::default(),
            request_timeout_ms: default_request_timeout_ms(),
            max_item_bytes: default_max_item_bytes(),
            max_field_bytes: default_max_field_bytes(),
            ttl_secs: default_ttl_secs(),
            session_idle_secs: default_session_idle_secs(),
            migration: MigrationSettings::default(),
        }
    }
}

impl AppConfig {
    /// Per-call remote timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Result TTL, or `None` when expiry is disabled.
    pub fn ttl(&self) -> Option<chrono::Duration> {
        (self.ttl_secs > 0).then(|| chrono::Duration::seconds(self.ttl_secs as i64))
    }

    pub fn session_idle(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_idle_secs as i64)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `CRAWLSTORE_`
    /// 2. TOML file from `CRAWLSTORE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file or environment cannot be parsed, or
    /// validation fails after loading.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("CRAWLSTORE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("CRAWLSTORE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Credential pair from explicit settings, if both halves are present.
    pub fn explicit_credentials(&self) -> Option<(&str, &str)> {
        match (self.access_key_id.as_deref(), self.secret_access_key.as_deref()) {
            (Some(id), Some(secret)) => Some((id, secret)),
            _ => None,
        }
    }
}
