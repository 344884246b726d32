//! Terminology client: fan-out search over a selection of sources.
//!
//! Each source is queried concurrently with its own timeout and retry
//! budget. A failing source never fails the query as long as another one
//! answered; failures are reported next to the merged, ranked matches.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::adapters::TerminologySource;
use crate::core::retry::RetryPolicy;
use crate::domain::{CandidateMatch, LanguageTag, SearchResult, SourceError, SourceFailure, SourceId};

/// Query-level failure: no source answered, or none could be selected
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("all {} terminology sources failed", .0.len())]
    AllSourcesFailed(Vec<SourceFailure>),

    #[error("no terminology selected")]
    NoSourceSelected,

    #[error("terminology '{0}' is not configured")]
    UnknownSource(SourceId),
}

/// Builds a source for a terminology that is not configured
pub type SourceFactory = Arc<dyn Fn(&SourceId) -> Arc<dyn TerminologySource> + Send + Sync>;

/// Searches a selection of terminology sources for a phrase and ranks the union
pub struct TerminologyClient {
    sources: Vec<Arc<dyn TerminologySource>>,
    factory: Option<SourceFactory>,
    timeout: Duration,
    retry: RetryPolicy,
}

/// Candidate plus the positions used for deterministic tie-breaking
struct Ranked {
    source_order: usize,
    upstream_rank: usize,
    candidate: CandidateMatch,
}

impl TerminologyClient {
    /// Create a client over sources in declared order
    pub fn new(sources: Vec<Arc<dyn TerminologySource>>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            sources,
            factory: None,
            timeout,
            retry,
        }
    }

    /// Serve selections naming unconfigured terminologies through `factory`
    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Identifiers of the configured sources, in declared order
    pub fn source_ids(&self) -> Vec<SourceId> {
        self.sources.iter().map(|s| s.spec().id.clone()).collect()
    }

    pub fn sources(&self) -> &[Arc<dyn TerminologySource>] {
        &self.sources
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sources serving a selection of ids.
    ///
    /// Configured sources come first in declaration order, followed by
    /// unconfigured ids in id order, built by the source factory.
    pub fn select(&self, ids: &[SourceId]) -> Result<Vec<Arc<dyn TerminologySource>>, SearchError> {
        if ids.is_empty() {
            return Err(SearchError::NoSourceSelected);
        }

        let mut selected: Vec<Arc<dyn TerminologySource>> = self
            .sources
            .iter()
            .filter(|s| ids.contains(&s.spec().id))
            .cloned()
            .collect();

        let mut extra: Vec<&SourceId> = ids
            .iter()
            .filter(|id| !self.sources.iter().any(|s| s.spec().id == **id))
            .collect();
        extra.sort();
        extra.dedup();

        for id in extra {
            match &self.factory {
                Some(factory) => selected.push(factory(id)),
                None => return Err(SearchError::UnknownSource(id.clone())),
            }
        }
        Ok(selected)
    }

    /// Search the selected sources for a phrase.
    ///
    /// Matches are ranked by descending score, then non-obsolete first, then
    /// shorter label, then source declaration order. Fails when no source
    /// can be selected or every selected source failed.
    #[instrument(skip(self, sources), fields(sources = sources.len()))]
    pub async fn search(
        &self,
        phrase: &str,
        sources: &[SourceId],
        language: &LanguageTag,
    ) -> Result<SearchResult, SearchError> {
        let selected = self.select(sources)?;
        let queries = selected
            .iter()
            .enumerate()
            .map(|(order, source)| async move { (order, self.query_source(source.as_ref(), phrase, language).await) });

        let mut ranked = Vec::new();
        let mut failures = Vec::new();

        for (source_order, answer) in join_all(queries).await {
            match answer {
                Ok(candidates) => {
                    ranked.extend(candidates.into_iter().enumerate().map(|(upstream_rank, candidate)| Ranked {
                        source_order,
                        upstream_rank,
                        candidate,
                    }));
                }
                Err(failure) => failures.push(failure),
            }
        }

        if failures.len() == selected.len() {
            return Err(SearchError::AllSourcesFailed(failures));
        }

        ranked.sort_by(rank_order);

        let mut seen = HashSet::new();
        let matches: Vec<CandidateMatch> = ranked
            .into_iter()
            .map(|r| r.candidate)
            .filter(|c| seen.insert((c.source.clone(), c.entity_id.clone())))
            .collect();

        debug!(matches = matches.len(), failed = failures.len(), "Terminology search complete");

        Ok(SearchResult { matches, failures })
    }

    /// Query one source, retrying transient failures with backoff
    async fn query_source(
        &self,
        source: &dyn TerminologySource,
        phrase: &str,
        language: &LanguageTag,
    ) -> Result<Vec<CandidateMatch>, SourceFailure> {
        let spec = source.spec();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(self.timeout, source.search(phrase, language)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::timeout(self.timeout)),
            };

            match result {
                Ok(shape) => return Ok(shape.into_candidates(&spec.id, phrase)),
                Err(error) if error.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        source = %spec.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Source lookup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(source = %spec.id, attempts = attempt, error = %error, "Source lookup failed");
                    return Err(SourceFailure {
                        source: spec.id.clone(),
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

fn rank_order(a: &Ranked, b: &Ranked) -> Ordering {
    b.candidate
        .score
        .total_cmp(&a.candidate.score)
        .then_with(|| a.candidate.obsolete.cmp(&b.candidate.obsolete))
        .then_with(|| label_len(&a.candidate).cmp(&label_len(&b.candidate)))
        .then_with(|| a.source_order.cmp(&b.source_order))
        .then_with(|| a.upstream_rank.cmp(&b.upstream_rank))
}

fn label_len(candidate: &CandidateMatch) -> usize {
    candidate.primary_label().chars().count()
}
