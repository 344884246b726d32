//! Main orchestrator for annotation runs.
//!
//! Owns the shared lookup cache and statistics, feeds records to a bounded
//! pool of annotation tasks and returns outcomes in input order. A record
//! whose task dies becomes a `Failure` outcome; the batch continues.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tracing::{error, info, instrument, warn};

use crate::adapters::{ExtractionBackend, LocalChunker, OllamaBackend, TerminologySource, TibSource};
use crate::config::{BackendKind, ResolvedConfig};
use crate::domain::{AnnotationOutcome, LanguageTag, OutcomeStatus, Record, ResponseShape, SourceId, SourceSpec};

use super::annotator::{AnnotationPolicy, Annotator, FieldLanguages, RecordPlan};
use super::cache::LookupCache;
use super::extractor::PhraseExtractor;
use super::statistics::{StatisticsCollector, StatisticsSnapshot};
use super::terminology::{SearchError, TerminologyClient};
use super::validator::{validate, validate_row_count};

/// Field name of the single virtual record built for interactive requests
pub const INTERACTIVE_FIELD: &str = "text";

/// Run-level settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Concurrent record tasks
    pub max_threads: usize,

    /// Process only this many records from the start of the input
    pub max_iterations: Option<usize>,

    /// Fields annotated in batch mode
    pub field_languages: FieldLanguages,

    /// Where to persist the cache (None = no persistence)
    pub cache_path: Option<PathBuf>,

    /// Where to persist statistics (None = no persistence)
    pub statistics_path: Option<PathBuf>,

    /// Save the cache every N completed records
    pub checkpoint_every: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_threads: 4,
            max_iterations: None,
            field_languages: FieldLanguages::default(),
            cache_path: None,
            statistics_path: None,
            checkpoint_every: None,
        }
    }
}

/// Stops submission of new records; running ones finish normally
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Component health as reported by `check`
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub component: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

/// One record end to end: annotate, validate, count
struct RecordWorker {
    annotator: Annotator,
    statistics: Arc<StatisticsCollector>,
}

impl RecordWorker {
    async fn process(&self, index: usize, record: Record, plan: &RecordPlan) -> AnnotationOutcome {
        let outcome = self.annotator.annotate(index, record, plan).await;

        let issues = validate(&outcome);
        if !issues.is_empty() {
            warn!(index, issues = issues.len(), "Annotated record failed validation");
        }
        let outcome = outcome.with_validation(issues);

        self.statistics
            .record(&outcome, outcome.cache_hits, outcome.cache_misses);
        outcome
    }
}

/// Annotation engine
pub struct Orchestrator {
    worker: Arc<RecordWorker>,
    cache: LookupCache,
    statistics: Arc<StatisticsCollector>,
    settings: EngineSettings,
    stop: StopSignal,
}

impl Orchestrator {
    /// Create an orchestrator around an annotator. The annotator's cache
    /// becomes the engine's cache.
    pub fn new(annotator: Annotator, settings: EngineSettings) -> Self {
        let cache = annotator.cache().clone();
        let statistics = Arc::new(StatisticsCollector::new());
        Self {
            worker: Arc::new(RecordWorker {
                annotator,
                statistics: Arc::clone(&statistics),
            }),
            cache,
            statistics,
            settings,
            stop: StopSignal::default(),
        }
    }

    /// Build the engine from validated configuration: sources, backends,
    /// persisted cache and paths
    pub async fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let settings = &config.settings;
        settings.validate()?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("termtagger/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let sources: Vec<Arc<dyn TerminologySource>> = settings
            .ts_sources
            .source_specs()
            .into_iter()
            .map(|spec| {
                Arc::new(TibSource::new(
                    spec,
                    settings.ts_sources.base_url.clone(),
                    settings.ts_sources.rows,
                    http.clone(),
                )) as Arc<dyn TerminologySource>
            })
            .collect();

        let mut backends: Vec<Arc<dyn ExtractionBackend>> = Vec::new();
        for kind in &settings.extraction.backends {
            match kind {
                BackendKind::Local => backends.push(Arc::new(LocalChunker::new())),
                BackendKind::Ollama => backends.push(Arc::new(OllamaBackend::new(settings.extraction.ollama.clone())?)),
            }
        }

        let ts = settings.ts_sources.clone();
        let factory_http = http.clone();
        let client = TerminologyClient::new(sources, ts.timeout(), ts.retry_policy.clone()).with_source_factory(
            Arc::new(move |id: &SourceId| {
                Arc::new(TibSource::new(
                    SourceSpec::ontology(id.as_str(), ResponseShape::Search),
                    ts.base_url.clone(),
                    ts.rows,
                    factory_http.clone(),
                )) as Arc<dyn TerminologySource>
            }),
        );
        let extractor = PhraseExtractor::new(backends, settings.annotation.min_phrase_length);

        let window = settings.cache.staleness();
        let cache_path = (settings.cache.enabled && settings.cache.persist).then(|| config.cache_path());
        let cache = match &cache_path {
            Some(path) => LookupCache::load(path, window, settings.cache.enabled).await?,
            None => LookupCache::new(window, settings.cache.enabled),
        };

        let policy = AnnotationPolicy {
            ignore_fields: settings.ignore_patterns()?,
            ignore_values: settings.annotation.ignore_cell_value.iter().map(|v| v.trim().to_string()).collect(),
            min_score: settings.annotation.min_score,
        };

        let annotator = Annotator::new(Arc::new(extractor), Arc::new(client), cache, policy);

        let engine = EngineSettings {
            max_threads: settings.max_threads(),
            max_iterations: settings.annotation.max_iterations,
            field_languages: FieldLanguages::from_map(&settings.annotation.relevant_fields),
            cache_path,
            statistics_path: settings.persist_statistics.then(|| config.statistics_path()),
            checkpoint_every: settings.checkpoint_every.filter(|n| *n > 0),
        };

        Ok(Self::new(annotator, engine))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    /// Handle that stops submission of further records
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Consistent copy of the statistics so far
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Annotate records with at most `max_threads` in flight.
    ///
    /// Outcomes come back in input order. With `max_iterations` set only
    /// that prefix of the input is processed; after a stop signal no further
    /// record is started.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn run(&self, records: Vec<Record>) -> Vec<AnnotationOutcome> {
        let limit = self
            .settings
            .max_iterations
            .unwrap_or(usize::MAX)
            .min(records.len());
        let threads = self.settings.max_threads.max(1);
        info!(limit, threads, "Starting annotation run");

        let plan = Arc::new(RecordPlan::new(
            self.settings.field_languages.clone(),
            self.source_ids(),
        ));
        let stop = self.stop.clone();
        let mut submitted = 0usize;
        let mut outcomes = Vec::with_capacity(limit);

        {
            let mut pending = stream::iter(records.into_iter().enumerate().take(limit))
                .take_while(|_| futures::future::ready(!stop.is_stopped()))
                .map(|(index, record)| {
                    submitted += 1;
                    self.spawn_record(index, record, Arc::clone(&plan))
                })
                .buffered(threads);

            while let Some(outcome) = pending.next().await {
                outcomes.push(outcome);
                if let Some(every) = self.settings.checkpoint_every {
                    if outcomes.len() % every == 0 {
                        self.checkpoint().await;
                    }
                }
            }
        }

        if let Some(issue) = validate_row_count(submitted, outcomes.len()) {
            error!(?issue, "Output row count does not match input");
            self.statistics.record_validation_failure();
        }

        let failed = outcomes.iter().filter(|o| o.status == OutcomeStatus::Failure).count();
        info!(
            processed = outcomes.len(),
            failed,
            stopped = self.stop.is_stopped(),
            "Annotation run finished"
        );
        outcomes
    }

    /// Run one record on its own task so that a panic stays contained
    fn spawn_record(
        &self,
        index: usize,
        record: Record,
        plan: Arc<RecordPlan>,
    ) -> impl std::future::Future<Output = AnnotationOutcome> + '_ {
        let worker = Arc::clone(&self.worker);
        let fallback = record.clone();
        let handle = tokio::spawn(async move { worker.process(index, record, &plan).await });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(index, error = %e, "Record task failed");
                    let outcome = AnnotationOutcome::failed(index, fallback, format!("record task failed: {e}"));
                    self.statistics.record(&outcome, 0, 0);
                    outcome
                }
            }
        }
    }

    /// Configured terminology sources, searched unless a request selects others
    pub fn source_ids(&self) -> Vec<SourceId> {
        self.worker.annotator.client().source_ids()
    }

    /// Check that every id in a selection can be searched
    pub fn check_selection(&self, sources: &[SourceId]) -> Result<(), SearchError> {
        self.worker.annotator.client().select(sources).map(|_| ())
    }

    /// Annotate one record outside a batch
    pub async fn annotate_one(&self, index: usize, record: Record, plan: RecordPlan) -> AnnotationOutcome {
        self.spawn_record(index, record, Arc::new(plan)).await
    }

    /// Annotate a single free text as a one-field virtual record, searching
    /// the configured sources
    pub async fn annotate_text(&self, text: &str, language: LanguageTag) -> AnnotationOutcome {
        self.annotate_text_in(text, language, self.source_ids()).await
    }

    /// Annotate a single free text, searching only the selected sources
    pub async fn annotate_text_in(&self, text: &str, language: LanguageTag, sources: Vec<SourceId>) -> AnnotationOutcome {
        let record = Record::from_pairs([(INTERACTIVE_FIELD, text)]);
        let plan = RecordPlan::new(FieldLanguages::single(INTERACTIVE_FIELD, language), sources);
        self.annotate_one(0, record, plan).await
    }

    /// Health of every extraction backend and terminology source
    pub async fn health_check(&self) -> Vec<HealthStatus> {
        let annotator = &self.worker.annotator;
        let mut report = Vec::new();

        for backend in annotator.extractor().backends() {
            let result = backend.health_check().await;
            report.push(HealthStatus {
                component: format!("extraction:{}", backend.name()),
                healthy: result.is_ok(),
                detail: result.err().map(|e| format!("{e:#}")),
            });
        }
        for source in annotator.client().sources() {
            let result = source.health_check().await;
            report.push(HealthStatus {
                component: format!("terminology:{}", source.spec().id),
                healthy: result.is_ok(),
                detail: result.err().map(|e| format!("{e:#}")),
            });
        }

        report
    }

    /// Save the cache if persistence is configured; failures are logged
    async fn checkpoint(&self) {
        if let Some(path) = &self.settings.cache_path {
            if let Err(e) = self.cache.save(path).await {
                warn!(error = %e, "Cache checkpoint failed");
            }
        }
    }

    /// Persist cache and statistics
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(path) = &self.settings.cache_path {
            self.cache.save(path).await?;
        }
        if let Some(path) = &self.settings.statistics_path {
            self.statistics.persist(path).await?;
        }
        info!("Engine state persisted");
        Ok(())
    }
}
