//! Per-record annotation.
//!
//! A record moves through `Pending -> Extracting -> Resolving -> Merging ->
//! Done`. The annotator owns its record for the whole run; the only shared
//! state it touches is the lookup cache.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use glob::Pattern;
use tracing::{debug, instrument, warn};

use crate::core::cache::{CacheComputeError, Lookup, LookupCache, LookupFailure, Resolved};
use crate::core::extractor::PhraseExtractor;
use crate::core::merge::merge_field;
use crate::core::terminology::TerminologyClient;
use crate::domain::{
    AnnotationOutcome, AnnotationState, CandidateMatch, FieldSkip, LanguageTag, LookupKey, LookupOrigin,
    OutcomeStatus, Phrase, PhraseResolution, Record, SkippedField, SourceId,
};

/// Which fields to annotate, and in which language
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldLanguages(Vec<(String, LanguageTag)>);

impl FieldLanguages {
    /// Build from a language -> field names map. A field listed under
    /// several languages keeps the first one in tag order.
    pub fn from_map(map: &BTreeMap<String, Vec<String>>) -> Self {
        let mut fields: Vec<(String, LanguageTag)> = Vec::new();
        for (language, names) in map {
            for name in names {
                if !fields.iter().any(|(f, _)| f == name) {
                    fields.push((name.clone(), LanguageTag::new(language)));
                }
            }
        }
        Self(fields)
    }

    pub fn single(field: impl Into<String>, language: LanguageTag) -> Self {
        Self(vec![(field.into(), language)])
    }

    pub fn language_for(&self, field: &str) -> Option<&LanguageTag> {
        self.0.iter().find(|(f, _)| f == field).map(|(_, l)| l)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What to annotate in one record: fields with their languages, and the
/// terminology sources to search
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPlan {
    pub fields: FieldLanguages,
    pub sources: Vec<SourceId>,
}

impl RecordPlan {
    pub fn new(fields: FieldLanguages, sources: Vec<SourceId>) -> Self {
        Self { fields, sources }
    }
}

/// What to skip and what to accept
#[derive(Debug, Clone, Default)]
pub struct AnnotationPolicy {
    /// Field names never extracted
    pub ignore_fields: Vec<Pattern>,

    /// Cell values never extracted
    pub ignore_values: HashSet<String>,

    /// Top match is accepted only at or above this score
    pub min_score: f64,
}

impl AnnotationPolicy {
    fn skip_reason(&self, field: &str, value: &str) -> Option<FieldSkip> {
        if self.ignore_fields.iter().any(|p| p.matches(field)) {
            Some(FieldSkip::IgnoredField)
        } else if self.ignore_values.contains(value.trim()) {
            Some(FieldSkip::IgnoredValue)
        } else {
            None
        }
    }

    fn accept<'a>(&self, matches: &'a [CandidateMatch]) -> Option<&'a CandidateMatch> {
        matches.first().filter(|m| m.score >= self.min_score)
    }
}

/// Annotates one record at a time; shared by all workers
pub struct Annotator {
    extractor: Arc<PhraseExtractor>,
    client: Arc<TerminologyClient>,
    cache: LookupCache,
    policy: AnnotationPolicy,
}

/// Phrases extracted from one field
struct FieldPhrases {
    field: String,
    phrases: Vec<Phrase>,
}

impl Annotator {
    pub fn new(
        extractor: Arc<PhraseExtractor>,
        client: Arc<TerminologyClient>,
        cache: LookupCache,
        policy: AnnotationPolicy,
    ) -> Self {
        Self {
            extractor,
            client,
            cache,
            policy,
        }
    }

    pub fn extractor(&self) -> &PhraseExtractor {
        &self.extractor
    }

    pub fn client(&self) -> &TerminologyClient {
        &self.client
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }

    /// Annotate one record. Never fails: problems are reported in the outcome.
    #[instrument(skip(self, record, plan))]
    pub async fn annotate(&self, index: usize, record: Record, plan: &RecordPlan) -> AnnotationOutcome {
        let started = Instant::now();
        let mut state = AnnotationState::Pending;

        state = state.next();
        debug!(?state, "Extracting phrases");
        let mut skipped_fields = Vec::new();
        let mut backend_errors = Vec::new();
        let mut extracted = Vec::new();

        for (field, value) in record.fields() {
            let Some(language) = plan.fields.language_for(field) else {
                continue;
            };
            if let Some(skip) = self.policy.skip_reason(field, value) {
                skipped_fields.push(SkippedField {
                    field: field.to_string(),
                    skip,
                });
                continue;
            }

            match self.extractor.extract(value, field, language).await {
                Ok(extraction) => {
                    backend_errors.extend(extraction.failed_backends);
                    extracted.push(FieldPhrases {
                        field: field.to_string(),
                        phrases: extraction.phrases,
                    });
                }
                Err(e) => {
                    warn!(field, error = %e, "Field skipped, extraction failed");
                    backend_errors.extend(self.extractor.backends().iter().map(|b| b.name().to_string()));
                    skipped_fields.push(SkippedField {
                        field: field.to_string(),
                        skip: FieldSkip::ExtractionFailed { error: e.to_string() },
                    });
                }
            }
        }

        state = state.next();
        debug!(?state, fields = extracted.len(), "Resolving phrases");
        let lookups = self.resolve_all(&extracted, &plan.sources).await;

        let mut cache_hits = 0u32;
        let mut cache_misses = 0u32;
        for lookup in lookups.values() {
            match lookup {
                // Waited on a computation that failed: served by neither
                Err(failure) if failure.origin == LookupOrigin::Joined => {}
                _ if origin_of(lookup).is_hit() => cache_hits += 1,
                _ => cache_misses += 1,
            }
        }

        let mut resolutions = Vec::new();
        let mut used = HashSet::new();
        let mut processed_fields = 0usize;
        for field in &extracted {
            let mut answered = field.phrases.is_empty();
            for phrase in &field.phrases {
                let key = lookup_key(phrase, &plan.sources);
                let Some(lookup) = lookups.get(&key) else {
                    continue;
                };
                // Later uses of the same lookup within this record are reuse
                let first_use = used.insert(key);
                let resolution = self.resolution(phrase, lookup, first_use);
                answered |= resolution.answered();
                resolutions.push(resolution);
            }
            if answered {
                processed_fields += 1;
            }
        }

        state = state.next();
        debug!(?state, phrases = resolutions.len(), "Merging matches");
        let mut annotated = record.clone();
        for field in &extracted {
            let matches: Vec<(&str, &CandidateMatch)> = resolutions
                .iter()
                .filter(|r| r.phrase.field == field.field)
                .filter_map(|r| r.chosen.as_ref().map(|m| (r.phrase.surface.as_str(), m)))
                .collect();
            if let Some(value) = record.get(&field.field) {
                annotated.set(field.field.clone(), merge_field(value, &matches));
            }
        }

        let had_error = skipped_fields
            .iter()
            .any(|s| matches!(s.skip, FieldSkip::ExtractionFailed { .. }))
            || resolutions.iter().any(PhraseResolution::has_error);
        let status = if !had_error {
            OutcomeStatus::Success
        } else if processed_fields > 0 {
            OutcomeStatus::PartialFailure
        } else {
            OutcomeStatus::Failure
        };

        state = state.next();
        debug!(?state, ?status, hits = cache_hits, misses = cache_misses, "Record annotated");

        AnnotationOutcome {
            index,
            status,
            original: record,
            annotated,
            resolutions,
            skipped_fields,
            backend_errors,
            cache_hits,
            cache_misses,
            duration_ms: started.elapsed().as_millis() as u64,
            validation: Vec::new(),
            error: None,
        }
    }

    /// Resolve every distinct phrase of the record concurrently
    async fn resolve_all(
        &self,
        extracted: &[FieldPhrases],
        sources: &[SourceId],
    ) -> HashMap<LookupKey, Result<Lookup, LookupFailure>> {
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for phrase in extracted.iter().flat_map(|f| f.phrases.iter()) {
            let key = lookup_key(phrase, sources);
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        let results = join_all(keys.iter().map(|key| self.resolve(key))).await;
        keys.into_iter().zip(results).collect()
    }

    async fn resolve(&self, key: &LookupKey) -> Result<Lookup, LookupFailure> {
        let client = Arc::clone(&self.client);
        let phrase = key.phrase.clone();
        let sources = key.sources.clone();
        let language = key.language.clone();

        self.cache
            .get_or_compute(key, move || async move {
                client
                    .search(&phrase, &sources, &language)
                    .await
                    .map(Resolved::from)
                    .map_err(CacheComputeError::from)
            })
            .await
    }

    fn resolution(
        &self,
        phrase: &Phrase,
        lookup: &Result<Lookup, LookupFailure>,
        first_use: bool,
    ) -> PhraseResolution {
        let origin = if first_use {
            origin_of(lookup)
        } else {
            LookupOrigin::Hit
        };

        match lookup {
            Ok(lookup) => PhraseResolution {
                phrase: phrase.clone(),
                chosen: self.policy.accept(&lookup.resolved.matches).cloned(),
                candidates: Arc::clone(&lookup.resolved.matches),
                origin,
                source_failures: lookup.resolved.failures.to_vec(),
                error: None,
            },
            Err(failure) => PhraseResolution {
                phrase: phrase.clone(),
                chosen: None,
                candidates: Arc::default(),
                origin,
                source_failures: match &failure.error {
                    CacheComputeError::AllSourcesFailed(failures) => failures.to_vec(),
                    _ => Vec::new(),
                },
                error: Some(failure.error.to_string()),
            },
        }
    }
}

/// Cache key of a phrase looked up in a source selection
fn lookup_key(phrase: &Phrase, sources: &[SourceId]) -> LookupKey {
    LookupKey::new(&phrase.normalized, sources.iter().cloned(), phrase.language.clone())
}

fn origin_of(lookup: &Result<Lookup, LookupFailure>) -> LookupOrigin {
    match lookup {
        Ok(lookup) => lookup.origin,
        Err(failure) => failure.origin,
    }
}
