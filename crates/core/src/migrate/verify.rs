//! Sampled comparison of migrated records against the legacy store.

use serde::{Deserialize, Serialize};

use crate::backend::CacheBackend;
use crate::{CacheKey, Error};

/// Mismatches listed in a report before truncating.
const MAX_LISTED_MISMATCHES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub key: String,
    pub field: String,
}

/// Outcome of comparing sampled keys between the two stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Keys compared (legacy copy still present).
    pub sampled: u64,
    pub matched: u64,
    pub mismatched: u64,
    /// Sampled keys absent from the target.
    pub missing_in_target: u64,
    /// Keys dropped from the sample because the legacy copy expired or
    /// disappeared.
    pub excluded: u64,
    #[serde(default)]
    pub mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    /// Matched share of sampled keys; 1.0 for an empty sample.
    pub fn rate(&self) -> f64 {
        if self.sampled == 0 { 1.0 } else { self.matched as f64 / self.sampled as f64 }
    }

    pub fn passes(&self, min_rate: f64) -> bool {
        self.rate() >= min_rate
    }

    fn mismatch(&mut self, key: &CacheKey, field: &str) {
        let err = Error::Consistency { key: key.storage_id(), field: field.to_string() };
        tracing::warn!(key = %key, field, error = %err, "verification mismatch");
        if self.mismatches.len() < MAX_LISTED_MISMATCHES {
            self.mismatches.push(Mismatch { key: key.storage_id(), field: field.to_string() });
        }
    }
}

/// Compare key, success flag and status code of each sampled legacy id
/// against its migrated copy.
///
/// # Errors
///
/// Returns the first backend error; a verification that cannot read both
/// stores is not meaningful.
pub async fn verify_sample(
    legacy: &dyn CacheBackend,
    target: &dyn CacheBackend,
    legacy_ids: &[String],
) -> Result<VerificationReport, Error> {
    let mut report = VerificationReport::default();
    let legacy_keys = legacy_ids
        .iter()
        .map(|id| CacheKey::persisted(id))
        .collect::<Result<Vec<_>, _>>()?;

    let originals = legacy.batch_get(&legacy_keys).await?;
    let mut pairs = Vec::with_capacity(legacy_keys.len());
    for legacy_key in &legacy_keys {
        let Some(Some(original)) = originals.get(legacy_key) else {
            report.excluded += 1;
            continue;
        };
        match original.key() {
            Ok(key) => pairs.push((key, original.clone())),
            Err(e) => {
                tracing::warn!(key = %legacy_key, error = %e, "sampled legacy row has no valid key");
                report.excluded += 1;
            }
        }
    }

    let target_keys: Vec<CacheKey> = pairs.iter().map(|(key, _)| key.clone()).collect();
    let migrated = target.batch_get(&target_keys).await?;

    for (key, mut original) in pairs {
        report.sampled += 1;
        original.url = key.url().to_string();

        match migrated.get(&key).and_then(Option::as_ref) {
            None => {
                report.missing_in_target += 1;
                report.mismatch(&key, "missing");
            }
            Some(copy) => match original.significant_mismatch(copy) {
                None => report.matched += 1,
                Some(field) => {
                    report.mismatched += 1;
                    report.mismatch(&key, field);
                }
            },
        }
    }

    tracing::info!(
        sampled = report.sampled,
        matched = report.matched,
        excluded = report.excluded,
        rate = report.rate(),
        "verification finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::model::CachedResult;

    async fn seed(backend: &MemoryBackend, url: &str, status: u16) -> String {
        let key = CacheKey::new(url).unwrap();
        backend.put(&key, &CachedResult::success(&key, status, "")).await.unwrap();
        key.storage_id()
    }

    #[test]
    fn test_empty_sample_rate() {
        let report = VerificationReport::default();
        assert_eq!(report.rate(), 1.0);
        assert!(report.passes(0.95));
    }

    #[tokio::test]
    async fn test_matching_copies() {
        let legacy = MemoryBackend::default();
        let target = MemoryBackend::default();
        let mut ids = Vec::new();
        for url in ["a.com", "b.com"] {
            ids.push(seed(&legacy, url, 200).await);
            seed(&target, url, 200).await;
        }

        let report = verify_sample(&legacy, &target, &ids).await.unwrap();
        assert_eq!(report.sampled, 2);
        assert_eq!(report.matched, 2);
        assert_eq!(report.rate(), 1.0);
    }

    #[tokio::test]
    async fn test_mismatch_and_missing() {
        let legacy = MemoryBackend::default();
        let target = MemoryBackend::default();
        let a = seed(&legacy, "a.com", 200).await;
        seed(&target, "a.com", 404).await;
        let b = seed(&legacy, "b.com", 200).await;

        let report = verify_sample(&legacy, &target, &[a, b]).await.unwrap();
        assert_eq!(report.sampled, 2);
        assert_eq!(report.matched, 0);
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.missing_in_target, 1);
        assert_eq!(report.mismatches[0].field, "status_code");
        assert!(!report.passes(0.5));
    }

    #[tokio::test]
    async fn test_vanished_legacy_rows_excluded() {
        let legacy = MemoryBackend::default();
        let target = MemoryBackend::default();
        seed(&target, "a.com", 200).await;

        let report = verify_sample(&legacy, &target, &["https://a.com/".to_string()]).await.unwrap();
        assert_eq!(report.excluded, 1);
        assert_eq!(report.sampled, 0);
        assert_eq!(report.rate(), 1.0);
    }
}
