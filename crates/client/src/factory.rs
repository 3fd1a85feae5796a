//! Construction of both cache stores from configuration.

use std::sync::Arc;

use crawlstore_core::{AppConfig, CacheDb, Error, HybridRouter, RouterPolicy};

use crate::dynamo::DynamoBackend;

/// The legacy SQLite store and the remote adapter, ready to hand to a
/// router or a migrator.
#[derive(Debug, Clone)]
pub struct Backends {
    pub legacy: Arc<CacheDb>,
    pub remote: Arc<DynamoBackend>,
}

impl Backends {
    /// Wrap both stores in a router configured from `config`.
    pub fn into_router(self, config: &AppConfig) -> Result<HybridRouter, Error> {
        Ok(HybridRouter::new(self.legacy, self.remote, RouterPolicy::from_config(config)?))
    }
}

/// Open the legacy database at `legacy_db_path` and build the remote adapter.
///
/// # Errors
///
/// Fails if the database cannot be opened or migrated, or if no remote
/// credentials can be resolved.
pub async fn open_backends(config: &AppConfig) -> Result<Backends, Error> {
    let legacy = CacheDb::open(&config.legacy_db_path).await?;
    let remote = DynamoBackend::from_config(config)?;
    tracing::debug!(legacy = %config.legacy_db_path.display(), "backends opened");
    Ok(Backends { legacy: Arc::new(legacy), remote: Arc::new(remote) })
}
