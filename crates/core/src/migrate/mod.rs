//! Batch migration from the legacy store to the remote store.
//!
//! A run walks the legacy store page by page (`Scanning`), re-encodes each
//! record into its canonical document form and writes it to the target
//! (`Transforming`), then samples migrated keys and compares them across
//! both stores (`Verifying`). Progress is kept in a [`MigrationCursor`]
//! saved after every batch, so an interrupted run resumes where it stopped.

pub mod cursor;
pub mod state;
pub mod verify;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::{CacheBackend, ScanItem};
use crate::codec::Codec;
use crate::config::MigrationSettings;
use crate::model::CachedResult;
use crate::{CacheKey, Error};

pub use cursor::CursorStore;
pub use state::{KeyFailure, MigrationCounters, MigrationCursor, MigrationPhase};
pub use verify::{VerificationReport, verify_sample};

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Scan and transform without writing anything.
    pub dry_run: bool,
    /// Verify a sample of migrated keys after the scan completes.
    pub verify: bool,
    pub batch_size: usize,
    pub sample_size: usize,
    /// Count keys already in the target as skipped instead of rewriting.
    pub skip_existing: bool,
    pub max_failure_rate: f64,
    /// Scanned rows required before the failure rate can end a run early.
    pub min_scanned_for_abort: u64,
    pub min_verification_rate: f64,
    /// Concurrent target writes per batch.
    pub max_in_flight: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self::from_settings(&MigrationSettings::default())
    }
}

impl MigrationOptions {
    pub fn from_settings(settings: &MigrationSettings) -> Self {
        Self {
            dry_run: false,
            verify: true,
            batch_size: settings.batch_size,
            sample_size: settings.sample_size,
            skip_existing: false,
            max_failure_rate: settings.max_failure_rate,
            min_scanned_for_abort: settings.min_scanned_for_abort,
            min_verification_rate: settings.min_verification_rate,
            max_in_flight: settings.max_in_flight,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 || self.sample_size == 0 || self.max_in_flight == 0 {
            return Err(Error::Validation("batch size, sample size and in-flight limit must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.max_failure_rate) || !(0.0..=1.0).contains(&self.min_verification_rate) {
            return Err(Error::Validation("rates must be within 0.0..=1.0".into()));
        }
        Ok(())
    }
}

/// Summary of a run, printed by the migration tool.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub phase: MigrationPhase,
    pub dry_run: bool,
    pub counters: MigrationCounters,
    pub verification: Option<VerificationReport>,
    pub verification_rate: Option<f64>,
    pub failure_reason: Option<String>,
    pub failures: Vec<KeyFailure>,
    pub duplicates: Vec<KeyFailure>,
    pub last_key: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationReport {
    fn new(cursor: &MigrationCursor, dry_run: bool) -> Self {
        Self {
            phase: cursor.phase,
            dry_run,
            counters: cursor.counters,
            verification_rate: cursor.verification.as_ref().map(VerificationReport::rate),
            verification: cursor.verification.clone(),
            failure_reason: cursor.failure_reason.clone(),
            failures: cursor.failures.clone(),
            duplicates: cursor.duplicate_ids.clone(),
            last_key: cursor.last_key.clone(),
            started_at: cursor.started_at,
            finished_at: cursor.finished_at,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.phase == MigrationPhase::Complete
    }
}

/// A record ready to be written under its canonical key.
struct Prepared {
    legacy_id: String,
    key: CacheKey,
    record: CachedResult,
}

/// Moves records from `legacy` into `target`.
pub struct Migrator {
    legacy: Arc<dyn CacheBackend>,
    target: Arc<dyn CacheBackend>,
    codec: Codec,
    options: MigrationOptions,
    store: Option<CursorStore>,
}

impl Migrator {
    pub fn new(
        legacy: Arc<dyn CacheBackend>, target: Arc<dyn CacheBackend>, codec: Codec, options: MigrationOptions,
    ) -> Self {
        Self { legacy, target, codec, options, store: None }
    }

    /// Persist progress to `store` so runs can resume. Ignored in dry runs.
    pub fn with_cursor_store(mut self, store: CursorStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Run until the legacy store is exhausted, the run fails, or `cancel`
    /// fires. Cancellation pauses the run and saves the cursor.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid options or when the cursor cannot be
    /// loaded or saved. Backend failures end the run in `Failed` and are
    /// reported, not returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MigrationReport, Error> {
        self.options.validate()?;
        let mut cursor = self.load_cursor().await?;

        if cursor.phase.is_terminal() {
            tracing::info!(phase = %cursor.phase, "migration already finished; reset the cursor to run again");
            return Ok(MigrationReport::new(&cursor, self.options.dry_run));
        }

        tracing::info!(
            dry_run = self.options.dry_run,
            batch_size = self.options.batch_size,
            resume_after = ?cursor.last_key,
            legacy = self.legacy.name(),
            target = self.target.name(),
            "migration starting"
        );

        match (cursor.phase, cursor.resume_phase) {
            (MigrationPhase::Paused, Some(resume)) => cursor.transition(resume)?,
            (MigrationPhase::Idle | MigrationPhase::Paused, _) => cursor.transition(MigrationPhase::Scanning)?,
            _ => {}
        }

        let exhausted = match self.migrate_batches(&mut cursor, &cancel).await {
            Ok(exhausted) => exhausted,
            Err(e) => {
                cursor.fail(e.to_string());
                false
            }
        };

        if !cursor.phase.is_terminal() {
            if !exhausted {
                cursor.transition(MigrationPhase::Paused)?;
                tracing::info!(last_key = ?cursor.last_key, "migration paused");
            } else if self.options.verify && !self.options.dry_run {
                self.verify(&mut cursor).await?;
            } else {
                cursor.transition(MigrationPhase::Complete)?;
            }
        }

        self.save_cursor(&cursor).await?;
        let report = MigrationReport::new(&cursor, self.options.dry_run);
        tracing::info!(
            phase = %report.phase,
            scanned = report.counters.scanned,
            migrated = report.counters.migrated,
            failed = report.counters.failed,
            skipped = report.counters.skipped,
            duplicates = report.counters.duplicates,
            truncated = report.counters.truncated,
            "migration finished"
        );
        Ok(report)
    }

    /// Process batches until the store is exhausted (`true`), the run is
    /// cancelled (`false`) or the failure rate is exceeded (cursor failed).
    ///
    /// Mid-run the rate only counts once `min_scanned_for_abort` rows have
    /// been scanned; the final rate over the whole store always counts.
    async fn migrate_batches(&self, cursor: &mut MigrationCursor, cancel: &CancellationToken) -> Result<bool, Error> {
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            cursor.transition(MigrationPhase::Scanning)?;
            let page = self.legacy.scan(cursor.last_key.as_deref(), self.options.batch_size).await?;
            let last_id = page.items.last().map(|item| item.id.clone());
            tracing::debug!(rows = page.items.len(), after = ?cursor.last_key, "scanned batch");

            if !page.items.is_empty() {
                cursor.transition(MigrationPhase::Transforming)?;
                self.transform_batch(cursor, page.items).await?;
                cursor.last_key = last_id;
            }
            cursor.updated_at = Utc::now();

            let exhausted = page.next.is_none();
            let rate = cursor.counters.failure_rate();
            let conclusive = exhausted || cursor.counters.scanned >= self.options.min_scanned_for_abort;
            if conclusive && rate > self.options.max_failure_rate {
                cursor.fail(format!(
                    "failure rate {:.3} exceeds threshold {:.3} after {} rows",
                    rate, self.options.max_failure_rate, cursor.counters.scanned
                ));
                return Ok(false);
            }

            if exhausted {
                return Ok(true);
            }
            self.save_cursor(cursor).await?;
        }
    }

    async fn transform_batch(&self, cursor: &mut MigrationCursor, items: Vec<ScanItem>) -> Result<(), Error> {
        let now = Utc::now();
        let mut prepared = Vec::with_capacity(items.len());

        for item in items {
            cursor.counters.scanned += 1;
            let record = match item.record {
                Ok(record) => record,
                Err(e) => {
                    cursor.record_failure(item.id, &e);
                    continue;
                }
            };
            if record.is_expired(now) {
                tracing::debug!(key = %item.id, "skipping expired record");
                cursor.counters.skipped += 1;
                continue;
            }
            let (key, record, degraded) = match self.prepare(record) {
                Ok(ready) => ready,
                Err(e) => {
                    cursor.record_failure(item.id, &e);
                    continue;
                }
            };

            let canonical = key.storage_id();
            if canonical != item.id {
                if let Some(kept) = self.owner_of(cursor, &key, &item.id).await? {
                    cursor.record_duplicate(item.id, &kept, &canonical);
                    continue;
                }
                cursor.rekeyed.insert(canonical, item.id.clone());
            }

            if degraded {
                cursor.counters.truncated += 1;
            }
            prepared.push(Prepared { legacy_id: item.id, key, record });
        }

        if self.options.skip_existing && !prepared.is_empty() {
            let keys: Vec<CacheKey> = prepared.iter().map(|p| p.key.clone()).collect();
            let existing = self.target.batch_get(&keys).await?;
            let before = prepared.len();
            prepared.retain(|p| !matches!(existing.get(&p.key), Some(Some(_))));
            cursor.counters.skipped += (before - prepared.len()) as u64;
        }

        if self.options.dry_run {
            cursor.counters.migrated += prepared.len() as u64;
            return Ok(());
        }

        let target = &self.target;
        let outcomes: Vec<(Prepared, Result<(), Error>)> = futures::stream::iter(prepared)
            .map(|p| async move {
                let outcome = target.put(&p.key, &p.record).await;
                (p, outcome)
            })
            .buffer_unordered(self.options.max_in_flight)
            .collect()
            .await;

        for (p, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    cursor.counters.migrated += 1;
                    cursor.offer_sample(&p.legacy_id, self.options.sample_size);
                }
                Err(e) => cursor.record_failure(p.legacy_id, &e),
            }
        }
        Ok(())
    }

    /// Re-key a legacy record under its canonical key and measure it against
    /// the codec limits the target applies on write.
    fn prepare(&self, mut record: CachedResult) -> Result<(CacheKey, CachedResult, bool), Error> {
        let key = record.key()?;
        record.url = key.url().to_string();
        record.session_id = key.session_id().map(str::to_string);

        let encoded = self.codec.encode(&record);
        if encoded.is_degraded() {
            tracing::warn!(key = %key, fields = ?encoded.truncated, "record will be truncated in the target");
        }
        Ok((key, record, encoded.is_degraded()))
    }

    /// Legacy id already owning `key`, if not `legacy_id` itself. A live
    /// canonical row in the legacy store always wins; otherwise the first
    /// re-keyed row does.
    async fn owner_of(
        &self, cursor: &MigrationCursor, key: &CacheKey, legacy_id: &str,
    ) -> Result<Option<String>, Error> {
        let canonical = key.storage_id();
        match self.legacy.get(key).await {
            Ok(Some(_)) => return Ok(Some(canonical)),
            Ok(None) => {}
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => tracing::debug!(key = %canonical, error = %e, "canonical legacy row unreadable"),
        }
        Ok(cursor.rekeyed.get(&canonical).filter(|kept| kept.as_str() != legacy_id).cloned())
    }

    async fn verify(&self, cursor: &mut MigrationCursor) -> Result<(), Error> {
        cursor.transition(MigrationPhase::Verifying)?;
        match verify_sample(self.legacy.as_ref(), self.target.as_ref(), &cursor.sample).await {
            Ok(report) => {
                let rate = report.rate();
                let passed = report.passes(self.options.min_verification_rate);
                cursor.verification = Some(report);
                if passed {
                    cursor.transition(MigrationPhase::Complete)?;
                } else {
                    cursor.fail(format!(
                        "verification rate {:.3} below threshold {:.3}",
                        rate, self.options.min_verification_rate
                    ));
                }
            }
            Err(e) => cursor.fail(format!("verification failed: {e}")),
        }
        Ok(())
    }

    async fn load_cursor(&self) -> Result<MigrationCursor, Error> {
        match (&self.store, self.options.dry_run) {
            (Some(store), false) => Ok(store.load().await?.unwrap_or_default()),
            _ => Ok(MigrationCursor::new()),
        }
    }

    async fn save_cursor(&self, cursor: &MigrationCursor) -> Result<(), Error> {
        match (&self.store, self.options.dry_run) {
            (Some(store), false) => store.save(cursor).await,
            _ => Ok(()),
        }
    }
}
