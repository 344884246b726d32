//! Shared fakes for integration tests.
//!
//! Terminology sources and extraction backends that answer from memory,
//! count their calls and fail on demand.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use termtagger::adapters::{ExtractionBackend, ExtractionError, LocalChunker, TerminologySource};
use termtagger::core::{
    AnnotationPolicy, Annotator, EngineSettings, FieldLanguages, LookupCache, Orchestrator, PhraseExtractor,
    RetryPolicy, SourceResponseShape, TerminologyClient, DEFAULT_STALENESS,
};
use termtagger::domain::{normalize, LanguageTag, ResponseShape, SourceError, SourceSpec};

/// Search-shape body with one doc per (label, iri)
pub fn search_body(hits: &[(&str, &str)]) -> String {
    let docs: Vec<serde_json::Value> = hits
        .iter()
        .map(|(label, iri)| {
            json!({
                "iri": iri,
                "label": label,
                "short_form": iri.rsplit('/').next().unwrap_or_default(),
                "ontology_name": "test",
                "type": "class",
            })
        })
        .collect();

    json!({
        "response": { "numFound": docs.len(), "start": 0, "docs": docs }
    })
    .to_string()
}

/// What a fake source does when asked
#[derive(Clone)]
pub enum Behavior {
    /// Answer from a phrase -> (label, iri) table; unknown phrases get no hits
    Answer(HashMap<String, Vec<(String, String)>>),

    /// Parse this raw body with the source's shape, whatever the phrase
    Body(String),

    /// Fail every call
    Fail(SourceError),

    /// Fail this many calls, then answer from the table
    FailFirst(usize, SourceError, HashMap<String, Vec<(String, String)>>),

    /// Never answer
    Hang,
}

/// In-memory terminology source
pub struct FakeSource {
    spec: SourceSpec,
    behavior: Behavior,
    delay: Duration,
    calls: AtomicUsize,
    phrase_calls: Mutex<HashMap<String, usize>>,
}

impl FakeSource {
    pub fn new(id: &str, behavior: Behavior) -> Self {
        Self::with_shape(id, ResponseShape::Search, behavior)
    }

    pub fn with_shape(id: &str, shape: ResponseShape, behavior: Behavior) -> Self {
        Self {
            spec: SourceSpec::ontology(id, shape),
            behavior,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            phrase_calls: Mutex::new(HashMap::new()),
        }
    }

    /// Answering source over a table of phrase -> hits
    pub fn answering(id: &str, table: &[(&str, &[(&str, &str)])]) -> Self {
        Self::new(id, Behavior::Answer(answer_table(table)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls made for one phrase (normalized)
    pub fn calls_for(&self, phrase: &str) -> usize {
        let calls = self.phrase_calls.lock().unwrap();
        calls.get(&normalize(phrase)).copied().unwrap_or(0)
    }

    fn answer(&self, table: &HashMap<String, Vec<(String, String)>>, phrase: &str) -> Result<SourceResponseShape, SourceError> {
        let hits: Vec<(&str, &str)> = table
            .get(&normalize(phrase))
            .map(|hits| hits.iter().map(|(l, i)| (l.as_str(), i.as_str())).collect())
            .unwrap_or_default();
        SourceResponseShape::parse(ResponseShape::Search, &search_body(&hits))
    }
}

pub fn answer_table(table: &[(&str, &[(&str, &str)])]) -> HashMap<String, Vec<(String, String)>> {
    table
        .iter()
        .map(|(phrase, hits)| {
            (
                normalize(phrase),
                hits.iter().map(|(l, i)| (l.to_string(), i.to_string())).collect(),
            )
        })
        .collect()
}

#[async_trait]
impl TerminologySource for FakeSource {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    async fn search(&self, phrase: &str, _language: &LanguageTag) -> Result<SourceResponseShape, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .phrase_calls
            .lock()
            .unwrap()
            .entry(normalize(phrase))
            .or_insert(0) += 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.behavior {
            Behavior::Answer(table) => self.answer(table, phrase),
            Behavior::Body(body) => SourceResponseShape::parse(self.spec.shape, body),
            Behavior::Fail(error) => Err(error.clone()),
            Behavior::FailFirst(n, error, table) => {
                if call < *n {
                    Err(error.clone())
                } else {
                    self.answer(table, phrase)
                }
            }
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        match &self.behavior {
            Behavior::Fail(error) => anyhow::bail!("{}", error),
            _ => Ok(()),
        }
    }
}

/// Backend that panics on any text containing `trigger`, else chunks locally
pub struct PanickingBackend {
    pub trigger: &'static str,
    inner: LocalChunker,
}

impl PanickingBackend {
    pub fn new(trigger: &'static str) -> Self {
        Self {
            trigger,
            inner: LocalChunker::new(),
        }
    }
}

#[async_trait]
impl ExtractionBackend for PanickingBackend {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn extract(&self, text: &str, language: &LanguageTag) -> Result<Vec<String>, ExtractionError> {
        if text.contains(self.trigger) {
            panic!("backend crashed on '{}'", self.trigger);
        }
        self.inner.extract(text, language).await
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Backend that always fails
pub struct FailingBackend;

#[async_trait]
impl ExtractionBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn extract(&self, _text: &str, _language: &LanguageTag) -> Result<Vec<String>, ExtractionError> {
        Err(ExtractionError::Backend {
            backend: "failing".into(),
            message: "connection refused".into(),
        })
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }
}

/// Backend that returns the same phrases for every text
pub struct FixedBackend(pub Vec<&'static str>);

#[async_trait]
impl ExtractionBackend for FixedBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn extract(&self, _text: &str, _language: &LanguageTag) -> Result<Vec<String>, ExtractionError> {
        Ok(self.0.iter().map(|p| p.to_string()).collect())
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn client(sources: Vec<Arc<dyn TerminologySource>>) -> TerminologyClient {
    TerminologyClient::new(sources, Duration::from_secs(2), RetryPolicy::none())
}

/// Annotator with a fresh cache
pub fn annotator(
    sources: Vec<Arc<dyn TerminologySource>>,
    backends: Vec<Arc<dyn ExtractionBackend>>,
    policy: AnnotationPolicy,
) -> Annotator {
    Annotator::new(
        Arc::new(PhraseExtractor::new(backends, 2)),
        Arc::new(client(sources)),
        LookupCache::new(DEFAULT_STALENESS, true),
        policy,
    )
}

/// Engine annotating the `text` field in English
pub fn engine(
    sources: Vec<Arc<dyn TerminologySource>>,
    backends: Vec<Arc<dyn ExtractionBackend>>,
    max_threads: usize,
) -> Orchestrator {
    Orchestrator::new(
        annotator(sources, backends, AnnotationPolicy::default()),
        EngineSettings {
            max_threads,
            field_languages: FieldLanguages::single("text", LanguageTag::english()),
            ..EngineSettings::default()
        },
    )
}

pub fn local() -> Vec<Arc<dyn ExtractionBackend>> {
    vec![Arc::new(LocalChunker::new())]
}
