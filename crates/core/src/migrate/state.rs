//! Migration state machine and the persisted cursor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::verify::VerificationReport;
use crate::Error;

/// Per-key failures retained in the cursor for diagnostics.
pub const MAX_RECORDED_FAILURES: usize = 100;

/// Phase of a migration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    #[default]
    Idle,
    Scanning,
    Transforming,
    Verifying,
    Complete,
    Failed,
    Paused,
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Transforming => write!(f, "transforming"),
            Self::Verifying => write!(f, "verifying"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl MigrationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Scanning and Transforming alternate once per batch.
    pub fn can_transition_to(self, next: Self) -> bool {
        use MigrationPhase::*;
        match (self, next) {
            (Complete | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Scanning) => true,
            (Scanning, Transforming | Verifying | Complete | Paused) => true,
            (Transforming, Scanning | Verifying | Complete | Paused) => true,
            (Verifying, Complete) => true,
            (Paused, Scanning | Transforming) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCounters {
    /// Rows read from the legacy store.
    pub scanned: u64,
    /// Rows written (or, in a dry run, that would have been written).
    pub migrated: u64,
    pub failed: u64,
    /// Expired rows and rows already present in the target.
    pub skipped: u64,
    /// Migrated rows whose canonical document lost fidelity.
    pub truncated: u64,
    /// Rows not written because another legacy row owns the same key.
    #[serde(default)]
    pub duplicates: u64,
}

impl MigrationCounters {
    /// Failed share of scanned rows.
    pub fn failure_rate(&self) -> f64 {
        if self.scanned == 0 { 0.0 } else { self.failed as f64 / self.scanned as f64 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: String,
    pub reason: String,
}

/// Resumable progress of a migration, owned by a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCursor {
    pub phase: MigrationPhase,
    /// Phase to re-enter when resuming from `Paused`.
    #[serde(default)]
    pub resume_phase: Option<MigrationPhase>,
    /// Last legacy id fully processed; scanning resumes after it.
    pub last_key: Option<String>,
    pub counters: MigrationCounters,
    #[serde(default)]
    pub failures: Vec<KeyFailure>,
    /// Rows dropped as duplicates, with the legacy id that kept the key.
    #[serde(default)]
    pub duplicate_ids: Vec<KeyFailure>,
    /// Canonical id -> the legacy id written under it, for legacy ids that
    /// were not already canonical.
    #[serde(default)]
    pub rekeyed: BTreeMap<String, String>,
    /// Reservoir of migrated legacy ids to verify.
    #[serde(default)]
    pub sample: Vec<String>,
    /// Migrated ids offered to the reservoir so far.
    #[serde(default)]
    pub sample_seen: u64,
    pub verification: Option<VerificationReport>,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for MigrationCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationCursor {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            phase: MigrationPhase::Idle,
            resume_phase: None,
            last_key: None,
            counters: MigrationCounters::default(),
            failures: Vec::new(),
            duplicate_ids: Vec::new(),
            rekeyed: BTreeMap::new(),
            sample: Vec::new(),
            sample_seen: 0,
            verification: None,
            failure_reason: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: MigrationPhase) -> Result<(), Error> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(Error::Validation(format!("illegal migration transition {} -> {}", self.phase, next)));
        }

        tracing::info!(from = %self.phase, to = %next, "migration phase change");
        if next == MigrationPhase::Paused {
            self.resume_phase = Some(self.phase);
        } else if self.phase == MigrationPhase::Paused {
            self.resume_phase = None;
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Terminal failure with a reason. Allowed from any non-terminal phase.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(phase = %self.phase, reason = %reason, "migration failed");
        if !self.phase.is_terminal() {
            self.phase = MigrationPhase::Failed;
            self.finished_at = Some(Utc::now());
        }
        self.failure_reason = Some(reason);
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, key: impl Into<String>, error: &Error) {
        let key = key.into();
        tracing::warn!(key = %key, error = %error, "record failed to migrate");
        self.counters.failed += 1;
        if self.failures.len() < MAX_RECORDED_FAILURES {
            self.failures.push(KeyFailure { key, reason: error.to_string() });
        }
    }

    /// Count `legacy_id` as a duplicate of `kept`, which owns `canonical`.
    pub fn record_duplicate(&mut self, legacy_id: impl Into<String>, kept: &str, canonical: &str) {
        let key = legacy_id.into();
        tracing::warn!(key = %key, kept, canonical, "legacy row collides with another row on its canonical key");
        self.counters.duplicates += 1;
        if self.duplicate_ids.len() < MAX_RECORDED_FAILURES {
            let reason = format!("{key} and {kept} both map to {canonical}; kept {kept}");
            self.duplicate_ids.push(KeyFailure { key, reason });
        }
    }

    /// Offer a migrated id to the verification reservoir of size `capacity`.
    pub fn offer_sample(&mut self, id: &str, capacity: usize) {
        self.sample_seen += 1;
        if self.sample.len() < capacity {
            self.sample.push(id.to_string());
            return;
        }
        let slot = rand::rng().random_range(0..self.sample_seen) as usize;
        if slot < capacity {
            self.sample[slot] = id.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(MigrationPhase::Transforming.to_string(), "transforming");
        assert_eq!(MigrationPhase::Paused.to_string(), "paused");
    }

    #[test]
    fn test_legal_transitions() {
        let mut cursor = MigrationCursor::new();
        cursor.transition(MigrationPhase::Scanning).unwrap();
        cursor.transition(MigrationPhase::Transforming).unwrap();
        cursor.transition(MigrationPhase::Paused).unwrap();
        assert_eq!(cursor.resume_phase, Some(MigrationPhase::Transforming));
        cursor.transition(MigrationPhase::Transforming).unwrap();
        assert_eq!(cursor.resume_phase, None);
        cursor.transition(MigrationPhase::Verifying).unwrap();
        cursor.transition(MigrationPhase::Complete).unwrap();
        assert!(cursor.finished_at.is_some());
    }

    #[test]
    fn test_illegal_transitions() {
        let mut cursor = MigrationCursor::new();
        assert!(cursor.transition(MigrationPhase::Verifying).is_err());
        assert!(cursor.transition(MigrationPhase::Paused).is_err());

        cursor.fail("boom");
        assert_eq!(cursor.phase, MigrationPhase::Failed);
        assert!(cursor.transition(MigrationPhase::Scanning).is_err());
        assert!(!MigrationPhase::Verifying.can_transition_to(MigrationPhase::Paused));
    }

    #[test]
    fn test_failure_list_is_capped() {
        let mut cursor = MigrationCursor::new();
        for i in 0..(MAX_RECORDED_FAILURES + 10) {
            cursor.record_failure(format!("k{i}"), &Error::Validation("bad".into()));
        }
        assert_eq!(cursor.counters.failed, (MAX_RECORDED_FAILURES + 10) as u64);
        assert_eq!(cursor.failures.len(), MAX_RECORDED_FAILURES);
    }

    #[test]
    fn test_duplicate_names_both_ids() {
        let mut cursor = MigrationCursor::new();
        cursor.record_duplicate("https://A.com", "https://a.com/", "https://a.com/");
        assert_eq!(cursor.counters.duplicates, 1);
        assert_eq!(cursor.counters.failed, 0);
        let reason = &cursor.duplicate_ids[0].reason;
        assert!(reason.contains("https://A.com") && reason.contains("kept https://a.com/"));
    }

    #[test]
    fn test_reservoir_bounded() {
        let mut cursor = MigrationCursor::new();
        for i in 0..1000 {
            cursor.offer_sample(&format!("k{i}"), 10);
        }
        assert_eq!(cursor.sample.len(), 10);
        assert_eq!(cursor.sample_seen, 1000);

        let mut small = MigrationCursor::new();
        for id in ["a", "b", "c"] {
            small.offer_sample(id, 10);
        }
        assert_eq!(small.sample, ["a", "b", "c"]);
    }

    #[test]
    fn test_failure_rate() {
        let counters = MigrationCounters { scanned: 20, failed: 1, ..Default::default() };
        assert!((counters.failure_rate() - 0.05).abs() < f64::EPSILON);
        assert_eq!(MigrationCounters::default().failure_rate(), 0.0);
    }
}
