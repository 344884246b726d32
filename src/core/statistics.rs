//! Process-wide annotation statistics.
//!
//! One collector per engine, shared by every worker. Each outcome is applied
//! under a single lock acquisition, so a snapshot never shows half of an
//! update.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::domain::{AnnotationOutcome, LookupOrigin, OutcomeStatus, ValidationIssue};

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,

    pub records_total: u64,
    pub records_success: u64,
    pub records_partial: u64,
    pub records_failed: u64,

    pub phrases_total: u64,
    pub matched: u64,
    pub missed: u64,

    /// Chosen matches that found no free occurrence to mark
    #[serde(default)]
    pub unplaced: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,

    pub validation_failures: u64,
    pub extraction_failures: u64,

    /// Failed lookups per terminology source
    pub source_errors: BTreeMap<String, u64>,

    /// Failed field extractions per backend
    pub extraction_errors: BTreeMap<String, u64>,

    /// Normalized phrases that ended without an accepted match
    pub missed_phrases: BTreeSet<String>,
}

impl StatisticsSnapshot {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            records_total: 0,
            records_success: 0,
            records_partial: 0,
            records_failed: 0,
            phrases_total: 0,
            matched: 0,
            missed: 0,
            unplaced: 0,
            cache_hits: 0,
            cache_misses: 0,
            validation_failures: 0,
            extraction_failures: 0,
            source_errors: BTreeMap::new(),
            extraction_errors: BTreeMap::new(),
            missed_phrases: BTreeSet::new(),
        }
    }

    /// Share of lookups served from the cache, 0.0 when nothing was looked up
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

/// Lock-protected statistics shared by all workers
pub struct StatisticsCollector {
    inner: Mutex<StatisticsSnapshot>,
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatisticsSnapshot::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatisticsSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one finished outcome
    pub fn record(&self, outcome: &AnnotationOutcome, cache_hits: u32, cache_misses: u32) {
        let mut stats = self.lock();

        stats.records_total += 1;
        match outcome.status {
            OutcomeStatus::Success => stats.records_success += 1,
            OutcomeStatus::PartialFailure => stats.records_partial += 1,
            OutcomeStatus::Failure => stats.records_failed += 1,
        }

        stats.cache_hits += u64::from(cache_hits);
        stats.cache_misses += u64::from(cache_misses);

        let unplaced: HashSet<(&str, &str)> = outcome
            .validation
            .iter()
            .filter_map(|issue| match issue {
                ValidationIssue::UnplacedMatch { field, phrase } => Some((field.as_str(), phrase.as_str())),
                _ => None,
            })
            .collect();

        for resolution in &outcome.resolutions {
            stats.phrases_total += 1;
            let phrase = &resolution.phrase;
            if resolution.chosen.is_some() {
                if unplaced.contains(&(phrase.field.as_str(), phrase.surface.as_str())) {
                    stats.unplaced += 1;
                } else {
                    stats.matched += 1;
                }
            } else {
                stats.missed += 1;
                stats.missed_phrases.insert(resolution.phrase.normalized.clone());
            }

            // Joined lookups share the computing worker's failures
            if resolution.origin == LookupOrigin::Computed {
                for failure in &resolution.source_failures {
                    *stats.source_errors.entry(failure.source.to_string()).or_insert(0) += 1;
                }
            }
        }

        stats.extraction_failures += outcome.extraction_failures() as u64;
        for backend in &outcome.backend_errors {
            *stats.extraction_errors.entry(backend.clone()).or_insert(0) += 1;
        }

        if !outcome.validation.is_empty() {
            stats.validation_failures += 1;
        }
    }

    /// Count a batch-level validation finding (e.g. row count mismatch)
    pub fn record_validation_failure(&self) {
        self.lock().validation_failures += 1;
    }

    /// Consistent copy of the current counters
    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.lock().clone()
    }

    /// Write the current snapshot as JSON
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string_pretty(&snapshot).context("Failed to serialize statistics")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create statistics directory: {}", parent.display()))?;
        }
        fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write statistics: {}", path.display()))?;

        info!(path = %path.display(), records = snapshot.records_total, "Saved statistics");
        Ok(())
    }
}
