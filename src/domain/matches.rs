//! Terminology sources, candidate matches and lookup keys.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::record::{normalize, LanguageTag};

/// Identifier of a configured terminology source (e.g. "fibo", "chebi").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What part of the terminology service a source searches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum SourceScope {
    /// A single ontology by id
    Ontology(String),

    /// A named collection of ontologies
    Collection(String),

    /// Every terminology the service knows
    All,
}

/// Response layout a source answers with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    /// Solr-style search: `response.docs`, snake_case keys, scalar label/type
    #[default]
    Search,

    /// Entity listing: top-level `elements`, camelCase keys, array label/type
    Entities,
}

/// A configured terminology source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub id: SourceId,
    pub scope: SourceScope,
    #[serde(default)]
    pub shape: ResponseShape,
}

impl SourceSpec {
    pub fn ontology(id: impl Into<String>, shape: ResponseShape) -> Self {
        let id = id.into();
        Self {
            id: SourceId::new(id.clone()),
            scope: SourceScope::Ontology(id),
            shape,
        }
    }

    pub fn collection(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: SourceId::new(name.clone()),
            scope: SourceScope::Collection(name),
            shape: ResponseShape::Search,
        }
    }

    pub fn all() -> Self {
        Self {
            id: SourceId::new("all"),
            scope: SourceScope::All,
            shape: ResponseShape::Search,
        }
    }
}

/// A normalized terminology hit.
///
/// Every source shape is mapped into this one record by the terminology
/// client; nothing downstream sees source-specific field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    /// Source that answered
    pub source: SourceId,

    /// Stable entity identifier (IRI)
    pub entity_id: String,

    /// Short identifier (short form / curie)
    pub short_id: String,

    /// Human-readable labels, first is preferred
    pub labels: Vec<String>,

    /// Entity types (class, property, individual, ...)
    #[serde(default)]
    pub entity_types: Vec<String>,

    /// Ontology the entity was found in
    #[serde(default)]
    pub ontology: Option<String>,

    /// Similarity between the looked-up phrase and the best label, 0.0..=1.0
    pub score: f64,

    #[serde(default)]
    pub obsolete: bool,

    #[serde(default)]
    pub defining_ontology: Option<bool>,
}

impl CandidateMatch {
    /// Preferred label used when merging into text
    pub fn primary_label(&self) -> &str {
        self.labels.first().map(String::as_str).unwrap_or_default()
    }

    /// A match must carry an identifier and at least one label to be usable
    pub fn is_valid(&self) -> bool {
        !self.entity_id.trim().is_empty() && self.labels.iter().any(|l| !l.trim().is_empty())
    }
}

/// Cache index: normalized phrase, ordered source set, language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LookupKey {
    pub phrase: String,
    pub sources: Vec<SourceId>,
    pub language: LanguageTag,
}

impl LookupKey {
    pub fn new<I>(phrase: &str, sources: I, language: LanguageTag) -> Self
    where
        I: IntoIterator<Item = SourceId>,
    {
        let mut sources: Vec<SourceId> = sources.into_iter().collect();
        sources.sort();
        sources.dedup();
        Self {
            phrase: normalize(phrase),
            sources,
            language,
        }
    }

    /// Short hash of the source set (first 16 hex chars of SHA256)
    pub fn source_signature(&self) -> String {
        let mut hasher = Sha256::new();
        for source in &self.sources {
            hasher.update(source.as_str().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{}",
            self.phrase,
            self.language,
            self.source_signature()
        )
    }
}

/// Why a single terminology source could not answer
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceError {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP status {status}")]
    Status { status: u16 },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("malformed response: {message}")]
    Malformed { message: String },
}

impl SourceError {
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            timeout_ms: after.as_millis() as u64,
        }
    }

    /// Transient failures are retried with backoff; the rest are final
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => true,
            Self::Status { status } => *status >= 500 || *status == 429,
            Self::Malformed { .. } => false,
        }
    }
}

/// A source that failed for one query, after retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: SourceId,
    pub error: SourceError,
    pub attempts: u32,
}

/// Aggregated answer of all sources for one phrase
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResult {
    /// Ranked matches from every source that answered
    pub matches: Vec<CandidateMatch>,

    /// Sources that did not answer
    pub failures: Vec<SourceFailure>,
}

impl SearchResult {
    /// True when every queried source answered
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
