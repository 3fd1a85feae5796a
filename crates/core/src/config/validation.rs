//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for out-of-range values or
    /// contradictory flags, and `ConfigError::Missing` when only half of a
    /// credential pair is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migration_percentage > 100 {
            return Err(invalid("migration_percentage", "must be between 0 and 100"));
        }

        if self.force_legacy && self.force_remote {
            return Err(invalid("force_legacy", "force_legacy and force_remote are mutually exclusive"));
        }

        if self.region.is_empty() {
            return Err(invalid("region", "must not be empty"));
        }

        if self.results_table.is_empty() || self.sessions_table.is_empty() {
            return Err(invalid("results_table", "table names must not be empty"));
        }

        match (&self.access_key_id, &self.secret_access_key) {
            (Some(_), None) => {
                return Err(ConfigError::Missing {
                    field: "secret_access_key".into(),
                    hint: "access_key_id is set; set CRAWLSTORE_SECRET_ACCESS_KEY too".into(),
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError::Missing {
                    field: "access_key_id".into(),
                    hint: "secret_access_key is set; set CRAWLSTORE_ACCESS_KEY_ID too".into(),
                });
            }
            _ => {}
        }

        if self.max_retries == 0 || self.max_retries > 20 {
            return Err(invalid("max_retries", "must be between 1 and 20"));
        }

        if self.max_pool_connections == 0 {
            return Err(invalid("max_pool_connections", "must be greater than 0"));
        }

        if self.request_timeout_ms < 100 {
            return Err(invalid("request_timeout_ms", "must be at least 100ms"));
        }
        if self.request_timeout_ms > 300_000 {
            return Err(invalid("request_timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        if self.max_field_bytes == 0 {
            return Err(invalid("max_field_bytes", "must be greater than 0"));
        }
        if self.max_field_bytes > self.max_item_bytes {
            return Err(invalid("max_field_bytes", "must not exceed max_item_bytes"));
        }

        let m = &self.migration;
        if m.batch_size == 0 {
            return Err(invalid("migration.batch_size", "must be greater than 0"));
        }
        if m.sample_size == 0 {
            return Err(invalid("migration.sample_size", "must be greater than 0"));
        }
        if m.max_in_flight == 0 {
            return Err(invalid("migration.max_in_flight", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&m.max_failure_rate) {
            return Err(invalid("migration.max_failure_rate", "must be between 0.0 and 1.0"));
        }
        if !(0.0..=1.0).contains(&m.min_verification_rate) {
            return Err(invalid("migration.min_verification_rate", "must be between 0.0 and 1.0"));
        }

        if self.dual_write && (self.force_legacy || self.force_remote) {
            tracing::warn!(
                force_legacy = self.force_legacy,
                force_remote = self.force_remote,
                "dual_write is set together with a force override; \
                 writes still mirror to the non-forced backend"
            );
        }

        Ok(())
    }
}
