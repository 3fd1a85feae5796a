//! Percentage-based routing between the legacy and remote stores.
//!
//! Every key hashes to a stable bucket in `0..100`; buckets below the
//! migration percentage belong to the remote store. Reads never fail: a
//! backend error or a key stranded on the other side of a percentage change
//! reads as "not cached". Writes surface failures from the routed backend
//! only.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Duration;
use serde::Serialize;

use crate::backend::{BatchResult, CacheBackend};
use crate::key::bucket_of;
use crate::model::{CachedResult, SessionState};
use crate::{AppConfig, CacheKey, Error};

/// Backend a key is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Legacy,
    Remote,
}

impl Target {
    pub fn other(self) -> Self {
        match self {
            Target::Legacy => Target::Remote,
            Target::Remote => Target::Legacy,
        }
    }
}

/// Operational override that bypasses the percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOverride {
    #[default]
    None,
    ForceLegacy,
    ForceRemote,
}

/// Route a storage id for a given percentage. Pure in `(id, percentage)`.
pub fn route_id(id: &str, percentage: u8) -> Target {
    if bucket_of(id) < percentage { Target::Remote } else { Target::Legacy }
}

/// Route a key for a given percentage. Pure in `(key, percentage)`.
pub fn route(key: &CacheKey, percentage: u8) -> Target {
    route_id(&key.storage_id(), percentage)
}

#[derive(Debug, Clone, Default)]
pub struct RouterPolicy {
    pub percentage: u8,
    pub route_override: RouteOverride,
    pub dual_write: bool,
    pub shadow_read: bool,
    pub fallback_on_miss: bool,
    /// Expiry applied to results written without one.
    pub ttl: Option<Duration>,
}

impl RouterPolicy {
    /// Policy routing `percentage` percent of keys to the remote store.
    pub fn with_percentage(percentage: u8) -> Result<Self, Error> {
        if percentage > 100 {
            return Err(Error::Validation(format!("migration percentage {percentage} exceeds 100")));
        }
        Ok(Self { percentage, ..Default::default() })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        let route_override = match (config.force_legacy, config.force_remote) {
            (true, true) => {
                return Err(Error::Validation("force_legacy and force_remote are mutually exclusive".into()));
            }
            (true, false) => RouteOverride::ForceLegacy,
            (false, true) => RouteOverride::ForceRemote,
            (false, false) => RouteOverride::None,
        };

        Ok(Self {
            route_override,
            dual_write: config.dual_write,
            shadow_read: config.shadow_read,
            fallback_on_miss: config.fallback_on_miss,
            ttl: config.ttl(),
            ..Self::with_percentage(config.migration_percentage)?
        })
    }

    fn target(&self, id: &str) -> Target {
        match self.route_override {
            RouteOverride::ForceLegacy => Target::Legacy,
            RouteOverride::ForceRemote => Target::Remote,
            RouteOverride::None => route_id(id, self.percentage),
        }
    }
}

/// Shadow-read comparison counters.
#[derive(Debug, Default)]
struct ShadowCounters {
    compared: AtomicU64,
    mismatched: AtomicU64,
    missing: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShadowStats {
    /// Reads where both backends returned a record.
    pub compared: u64,
    /// Compared reads whose significant fields differed.
    pub mismatched: u64,
    /// Reads where exactly one backend had the key.
    pub missing: u64,
    pub errors: u64,
}

/// Snapshot of the routing configuration and shadow counters.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub percentage: u8,
    pub route_override: RouteOverride,
    pub dual_write: bool,
    pub shadow_read: bool,
    pub fallback_on_miss: bool,
    pub legacy_backend: &'static str,
    pub remote_backend: &'static str,
    pub shadow: ShadowStats,
}

/// Routes cache operations across a legacy and a remote backend.
pub struct HybridRouter {
    legacy: Arc<dyn CacheBackend>,
    remote: Arc<dyn CacheBackend>,
    policy: RouterPolicy,
    shadow: ShadowCounters,
}

impl HybridRouter {
    pub fn new(legacy: Arc<dyn CacheBackend>, remote: Arc<dyn CacheBackend>, policy: RouterPolicy) -> Self {
        tracing::info!(
            percentage = policy.percentage,
            route_override = ?policy.route_override,
            dual_write = policy.dual_write,
            shadow_read = policy.shadow_read,
            "hybrid router initialized"
        );
        Self { legacy, remote, policy, shadow: ShadowCounters::default() }
    }

    pub fn policy(&self) -> &RouterPolicy {
        &self.policy
    }

    /// Backend this key is routed to under the current policy.
    pub fn target(&self, key: &CacheKey) -> Target {
        self.policy.target(&key.storage_id())
    }

    fn backend(&self, target: Target) -> &Arc<dyn CacheBackend> {
        match target {
            Target::Legacy => &self.legacy,
            Target::Remote => &self.remote,
        }
    }

    fn fallback_enabled(&self) -> bool {
        self.policy.fallback_on_miss && self.policy.route_override == RouteOverride::None
    }

    /// Read a result. Backend failures degrade to `None`.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedResult> {
        let target = self.target(key);
        let primary = self.backend(target);
        let found = match primary.get(key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(key = %key, backend = primary.name(), error = %e, "cache read failed, treating as miss");
                None
            }
        };

        if self.policy.shadow_read {
            self.shadow_compare(key, found.as_ref(), target.other()).await;
        }

        if found.is_none() && self.fallback_enabled() {
            let other = self.backend(target.other());
            return match other.get(key).await {
                Ok(found) => {
                    if found.is_some() {
                        tracing::debug!(key = %key, backend = other.name(), "served from fallback backend");
                    }
                    found
                }
                Err(e) => {
                    tracing::warn!(key = %key, backend = other.name(), error = %e, "fallback read failed");
                    None
                }
            };
        }

        found
    }

    async fn shadow_compare(&self, key: &CacheKey, primary: Option<&CachedResult>, shadow_target: Target) {
        let shadow = self.backend(shadow_target);
        let other = match shadow.get(key).await {
            Ok(other) => other,
            Err(e) => {
                self.shadow.errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, backend = shadow.name(), error = %e, "shadow read failed");
                return;
            }
        };

        match (primary, other.as_ref()) {
            (Some(a), Some(b)) => {
                self.shadow.compared.fetch_add(1, Ordering::Relaxed);
                if let Some(field) = a.significant_mismatch(b) {
                    self.shadow.mismatched.fetch_add(1, Ordering::Relaxed);
                    let err = Error::Consistency { key: key.storage_id(), field: field.to_string() };
                    tracing::warn!(key = %key, field, error = %err, "shadow read mismatch");
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                self.shadow.missing.fetch_add(1, Ordering::Relaxed);
            }
            (None, None) => {}
        }
    }

    /// Write a result to the routed backend, and to the other one when
    /// dual-write is on.
    ///
    /// # Errors
    ///
    /// Returns the routed backend's error. A secondary failure is logged.
    pub async fn put(&self, key: &CacheKey, result: &CachedResult) -> Result<(), Error> {
        let result = self.with_default_ttl(result);
        let target = self.target(key);
        self.backend(target).put(key, &result).await?;

        if self.policy.dual_write {
            let secondary = self.backend(target.other());
            if let Err(e) = secondary.put(key, &result).await {
                tracing::warn!(key = %key, backend = secondary.name(), error = %e, "dual-write to secondary failed");
            }
        }
        Ok(())
    }

    fn with_default_ttl(&self, result: &CachedResult) -> CachedResult {
        match (result.expires_at, self.policy.ttl) {
            (None, Some(ttl)) => result.clone().with_ttl(Some(ttl)),
            _ => result.clone(),
        }
    }

    /// Read many keys, each from its routed backend. Both partitions are
    /// fetched concurrently.
    pub async fn batch_get(&self, keys: &[CacheKey]) -> BatchResult {
        let (legacy_keys, remote_keys): (Vec<CacheKey>, Vec<CacheKey>) =
            keys.iter().cloned().partition(|key| self.target(key) == Target::Legacy);

        let (legacy, remote) = tokio::join!(
            self.batch_from(Target::Legacy, &legacy_keys),
            self.batch_from(Target::Remote, &remote_keys),
        );

        let mut out = legacy;
        out.extend(remote);

        if self.fallback_enabled() {
            let (legacy_misses, remote_misses): (Vec<CacheKey>, Vec<CacheKey>) = out
                .iter()
                .filter(|(_, found)| found.is_none())
                .map(|(key, _)| key.clone())
                .partition(|key| self.target(key) == Target::Legacy);

            let (from_remote, from_legacy) = tokio::join!(
                self.batch_from(Target::Remote, &legacy_misses),
                self.batch_from(Target::Legacy, &remote_misses),
            );
            out.extend(from_remote.into_iter().chain(from_legacy).filter(|(_, found)| found.is_some()));
        }

        out
    }

    async fn batch_from(&self, target: Target, keys: &[CacheKey]) -> BatchResult {
        if keys.is_empty() {
            return BatchResult::new();
        }
        let backend = self.backend(target);
        match backend.batch_get(keys).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(backend = backend.name(), keys = keys.len(), error = %e, "batch read failed, treating as misses");
                keys.iter().map(|key| (key.clone(), None)).collect()
            }
        }
    }

    /// Delete a key from both backends.
    ///
    /// # Errors
    ///
    /// Returns the routed backend's error. A failure on the other backend
    /// is logged.
    pub async fn delete(&self, key: &CacheKey) -> Result<(), Error> {
        let target = self.target(key);
        self.backend(target).delete(key).await?;

        let other = self.backend(target.other());
        if let Err(e) = other.delete(key).await {
            tracing::warn!(key = %key, backend = other.name(), error = %e, "delete on secondary failed");
        }
        Ok(())
    }

    /// Remove every cached result from both stores, primary first. The
    /// primary is the legacy store unless reads are forced remote.
    ///
    /// # Errors
    ///
    /// Returns the primary store's error; a secondary failure is logged.
    pub async fn clear(&self) -> Result<u64, Error> {
        let primary = match self.policy.route_override {
            RouteOverride::ForceRemote => Target::Remote,
            _ => Target::Legacy,
        };
        let removed = self.backend(primary).clear().await?;

        let other = self.backend(primary.other());
        match other.clear().await {
            Ok(n) => tracing::info!(primary = removed, secondary = n, "cleared both stores"),
            Err(e) => tracing::warn!(backend = other.name(), error = %e, "clear on secondary failed"),
        }
        Ok(removed)
    }

    /// Larger of the two stores' counts. Keys present in both are not
    /// double counted.
    pub async fn total_count(&self) -> Result<u64, Error> {
        let (legacy, remote) = tokio::try_join!(self.legacy.total_count(), self.remote.total_count())?;
        Ok(legacy.max(remote))
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionState> {
        let backend = self.backend(self.policy.target(session_id));
        match backend.get_session(session_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(session_id, backend = backend.name(), error = %e, "session read failed, treating as miss");
                None
            }
        }
    }

    pub async fn put_session(&self, session: &SessionState) -> Result<(), Error> {
        let target = self.policy.target(&session.session_id);
        self.backend(target).put_session(session).await?;

        if self.policy.dual_write {
            let secondary = self.backend(target.other());
            if let Err(e) = secondary.put_session(session).await {
                tracing::warn!(session_id = %session.session_id, backend = secondary.name(), error = %e, "dual-write of session failed");
            }
        }
        Ok(())
    }

    pub fn shadow_stats(&self) -> ShadowStats {
        ShadowStats {
            compared: self.shadow.compared.load(Ordering::Relaxed),
            mismatched: self.shadow.mismatched.load(Ordering::Relaxed),
            missing: self.shadow.missing.load(Ordering::Relaxed),
            errors: self.shadow.errors.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> RouterStatus {
        RouterStatus {
            percentage: self.policy.percentage,
            route_override: self.policy.route_override,
            dual_write: self.policy.dual_write,
            shadow_read: self.policy.shadow_read,
            fallback_on_miss: self.policy.fallback_on_miss,
            legacy_backend: self.legacy.name(),
            remote_backend: self.remote.name(),
            shadow: self.shadow_stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn key(url: &str) -> CacheKey {
        CacheKey::new(url).unwrap()
    }

    fn key_in(range: std::ops::Range<u8>) -> CacheKey {
        (0..)
            .map(|i| key(&format!("site{i}.com")))
            .find(|k| range.contains(&k.bucket()))
            .unwrap()
    }

    fn router(policy: RouterPolicy) -> (HybridRouter, Arc<MemoryBackend>, Arc<MemoryBackend>) {
        let legacy = Arc::new(MemoryBackend::default());
        let remote = Arc::new(MemoryBackend::default());
        let router = HybridRouter::new(legacy.clone(), remote.clone(), policy);
        (router, legacy, remote)
    }

    #[test]
    fn test_route_is_pure_and_monotonic() {
        for i in 0..200 {
            let k = key(&format!("site{i}.com"));
            for p in [0u8, 1, 33, 50, 99, 100] {
                assert_eq!(route(&k, p), route(&k, p));
            }
            assert_eq!(route(&k, 0), Target::Legacy);
            assert_eq!(route(&k, 100), Target::Remote);
            if route(&k, 30) == Target::Remote {
                assert_eq!(route(&k, 60), Target::Remote);
            }
        }
    }

    #[test]
    fn test_route_spreads_keys() {
        let remote = (0..1000).filter(|i| route(&key(&format!("site{i}.com")), 50) == Target::Remote).count();
        assert!((350..650).contains(&remote), "remote share {remote}");
    }

    #[test]
    fn test_policy_rejects_bad_config() {
        assert!(RouterPolicy::with_percentage(101).is_err());

        let config = AppConfig { force_legacy: true, force_remote: true, ..Default::default() };
        assert!(matches!(RouterPolicy::from_config(&config), Err(Error::Validation(_))));

        let config = AppConfig { force_remote: true, migration_percentage: 10, ..Default::default() };
        let policy = RouterPolicy::from_config(&config).unwrap();
        assert_eq!(policy.route_override, RouteOverride::ForceRemote);
        assert_eq!(policy.percentage, 10);
    }

    #[tokio::test]
    async fn test_percentage_change_reads_as_miss() {
        let legacy = Arc::new(MemoryBackend::default());
        let remote = Arc::new(MemoryBackend::default());
        let k = key("a.com");

        let before = HybridRouter::new(legacy.clone(), remote.clone(), RouterPolicy::with_percentage(0).unwrap());
        before.put(&k, &CachedResult::success(&k, 200, "<p>a</p>")).await.unwrap();
        assert!(before.get(&k).await.is_some());

        let after = HybridRouter::new(legacy.clone(), remote.clone(), RouterPolicy::with_percentage(100).unwrap());
        assert!(after.get(&k).await.is_none());
        assert_eq!(legacy.writes(), 1);
        assert_eq!(remote.writes(), 0);
    }

    #[tokio::test]
    async fn test_fallback_on_miss_finds_other_side() {
        let legacy = Arc::new(MemoryBackend::default());
        let remote = Arc::new(MemoryBackend::default());
        let k = key("a.com");
        legacy.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();

        let policy = RouterPolicy { fallback_on_miss: true, ..RouterPolicy::with_percentage(100).unwrap() };
        let router = HybridRouter::new(legacy, remote, policy);
        assert!(router.get(&k).await.is_some());
        assert_eq!(router.batch_get(std::slice::from_ref(&k)).await[&k].as_ref().map(|r| r.status_code), Some(Some(200)));
    }

    #[tokio::test]
    async fn test_force_override_bypasses_percentage() {
        let policy = RouterPolicy { route_override: RouteOverride::ForceLegacy, ..RouterPolicy::with_percentage(100).unwrap() };
        let (router, legacy, remote) = router(policy);
        let k = key_in(0..100);
        router.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        assert_eq!(legacy.writes(), 1);
        assert_eq!(remote.writes(), 0);
    }

    #[tokio::test]
    async fn test_dual_write_secondary_failure_is_logged() {
        let policy = RouterPolicy { dual_write: true, ..RouterPolicy::with_percentage(0).unwrap() };
        let (router, legacy, remote) = router(policy);
        remote.set_unavailable(true);

        let k = key("a.com");
        router.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        assert_eq!(legacy.writes(), 1);

        remote.set_unavailable(false);
        router.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        assert_eq!(remote.writes(), 1);
    }

    #[tokio::test]
    async fn test_primary_write_failure_propagates() {
        let (router, legacy, _) = router(RouterPolicy::with_percentage(0).unwrap());
        legacy.set_unavailable(true);
        let k = key("a.com");
        let err = router.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_read_failure_degrades_to_miss() {
        let (router, legacy, _) = router(RouterPolicy::with_percentage(0).unwrap());
        let k = key("a.com");
        router.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        legacy.set_unavailable(true);
        assert!(router.get(&k).await.is_none());
        assert!(router.batch_get(std::slice::from_ref(&k)).await[&k].is_none());
    }

    #[tokio::test]
    async fn test_shadow_read_counts_mismatches() {
        let policy = RouterPolicy { shadow_read: true, ..RouterPolicy::with_percentage(0).unwrap() };
        let (router, legacy, remote) = router(policy);
        let k = key("a.com");
        legacy.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        remote.put(&k, &CachedResult::failure(&k, Some(500), "boom")).await.unwrap();

        let found = router.get(&k).await.unwrap();
        assert!(found.success);
        let stats = router.shadow_stats();
        assert_eq!(stats.compared, 1);
        assert_eq!(stats.mismatched, 1);

        let missing = key("b.com");
        legacy.put(&missing, &CachedResult::success(&missing, 200, "")).await.unwrap();
        router.get(&missing).await.unwrap();
        assert_eq!(router.status().shadow.missing, 1);
    }

    #[tokio::test]
    async fn test_batch_get_partitions_by_target() {
        let (router, legacy, remote) = router(RouterPolicy::with_percentage(50).unwrap());
        let low = key_in(0..50);
        let high = key_in(50..100);
        let absent = key("absent.example");

        remote.put(&low, &CachedResult::success(&low, 200, "")).await.unwrap();
        legacy.put(&high, &CachedResult::success(&high, 200, "")).await.unwrap();

        let found = router.batch_get(&[low.clone(), high.clone(), absent.clone()]).await;
        assert_eq!(found.len(), 3);
        assert!(found[&low].is_some());
        assert!(found[&high].is_some());
        assert!(found[&absent].is_none());
    }

    #[tokio::test]
    async fn test_put_applies_default_ttl() {
        let policy = RouterPolicy { ttl: Some(Duration::seconds(60)), ..RouterPolicy::with_percentage(0).unwrap() };
        let (router, _, _) = router(policy);
        let k = key("a.com");
        router.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        assert!(router.get(&k).await.unwrap().expires_at.is_some());
    }

    #[tokio::test]
    async fn test_total_count_is_max() {
        let (router, legacy, remote) = router(RouterPolicy::default());
        for name in ["a.com", "b.com", "c.com"] {
            let k = key(name);
            legacy.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        }
        let k = key("a.com");
        remote.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        assert_eq!(router.total_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_clears_both() {
        let (router, legacy, remote) = router(RouterPolicy::default());
        let k = key("a.com");
        legacy.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        remote.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        router.delete(&k).await.unwrap();
        assert_eq!(legacy.total_count().await.unwrap(), 0);
        assert_eq!(remote.total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sessions_routed_by_id() {
        let (router, legacy, remote) = router(RouterPolicy::with_percentage(100).unwrap());
        let session = SessionState::new("s1", serde_json::json!({"step": 2}), Duration::minutes(5));
        router.put_session(&session).await.unwrap();
        assert_eq!(remote.writes(), 1);
        assert_eq!(legacy.writes(), 0);
        assert_eq!(router.get_session("s1").await.unwrap().state, session.state);
    }

    #[tokio::test]
    async fn test_clear_empties_both_stores() {
        let (router, legacy, remote) = router(RouterPolicy::default());
        for i in 0..3 {
            let k = key(&format!("site{i}.com"));
            legacy.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        }
        let k = key("a.com");
        remote.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();

        assert_eq!(router.clear().await.unwrap(), 3);
        assert_eq!(legacy.total_count().await.unwrap(), 0);
        assert_eq!(remote.total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_tolerates_secondary_failure() {
        let (hybrid, legacy, remote) = router(RouterPolicy::default());
        let k = key("a.com");
        legacy.put(&k, &CachedResult::success(&k, 200, "")).await.unwrap();
        remote.set_unavailable(true);
        assert_eq!(hybrid.clear().await.unwrap(), 1);
        assert_eq!(legacy.total_count().await.unwrap(), 0);

        let forced = RouterPolicy { route_override: RouteOverride::ForceRemote, ..RouterPolicy::default() };
        let (hybrid, _legacy, remote) = router(forced);
        remote.set_unavailable(true);
        assert!(hybrid.clear().await.unwrap_err().is_retryable());
    }
}
