//! Per-record annotation outcomes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::matches::{CandidateMatch, SourceFailure};
use super::record::{Phrase, Record};

/// How completely a record was annotated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Every relevant field extracted and every lookup answered by all sources
    Success,

    /// Some fields or lookups failed, but at least one field was processed
    PartialFailure,

    /// No field could be processed
    Failure,
}

/// Annotator progress for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationState {
    Pending,
    Extracting,
    Resolving,
    Merging,
    Done,
}

impl AnnotationState {
    /// The state that follows this one; `Done` is terminal
    pub fn next(self) -> Self {
        match self {
            Self::Pending => Self::Extracting,
            Self::Extracting => Self::Resolving,
            Self::Resolving => Self::Merging,
            Self::Merging | Self::Done => Self::Done,
        }
    }
}

/// How a phrase lookup was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupOrigin {
    /// Fresh cache entry
    Hit,

    /// Joined another worker's in-flight computation
    Joined,

    /// This worker queried the terminology sources
    Computed,
}

impl LookupOrigin {
    pub fn is_hit(self) -> bool {
        !matches!(self, Self::Computed)
    }
}

/// A phrase and the match chosen for it
#[derive(Debug, Clone, Serialize)]
pub struct PhraseResolution {
    pub phrase: Phrase,

    /// Top-ranked accepted match, if any
    pub chosen: Option<CandidateMatch>,

    /// Ranked candidates the sources returned
    pub candidates: Arc<Vec<CandidateMatch>>,

    pub origin: LookupOrigin,

    /// Sources that failed for this lookup
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_failures: Vec<SourceFailure>,

    /// Set when the lookup failed as a whole
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhraseResolution {
    /// Lookup answered by at least one source
    pub fn answered(&self) -> bool {
        self.error.is_none()
    }

    /// Lookup hit an error on any source
    pub fn has_error(&self) -> bool {
        self.error.is_some() || !self.source_failures.is_empty()
    }
}

/// Why a field was not (fully) processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FieldSkip {
    /// Field name matched an ignore pattern
    IgnoredField,

    /// Field value is listed as an ignore value
    IgnoredValue,

    /// Every extraction backend failed for the field
    ExtractionFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedField {
    pub field: String,
    #[serde(flatten)]
    pub skip: FieldSkip,
}

/// Structural defect found in merged output. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// Removing the annotation markers does not give back the original text
    DataLoss { field: String },

    /// Annotated record lost a field the original had
    MissingField { field: String },

    /// A marker could not be parsed into the expected shape
    MalformedMarker { field: String, detail: String },

    MissingIdentifier { field: String, phrase: String },

    MissingLabel { field: String, phrase: String },

    /// The same match was embedded twice in one field
    DuplicateMatch { field: String, entity_id: String },

    /// A phrase has a chosen match but no marker in its field
    UnplacedMatch { field: String, phrase: String },

    /// Output row count differs from the processed input
    RowCountMismatch { expected: usize, actual: usize },
}

/// Result of annotating one record. Not mutated once returned.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotationOutcome {
    /// Position of the record in the input sequence
    pub index: usize,

    pub status: OutcomeStatus,

    /// Record as received
    pub original: Record,

    /// Record with annotation markers merged into its fields
    pub annotated: Record,

    pub resolutions: Vec<PhraseResolution>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_fields: Vec<SkippedField>,

    /// Extraction backends that failed, once per field
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backend_errors: Vec<String>,

    pub cache_hits: u32,

    pub cache_misses: u32,

    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationIssue>,

    /// Set when the record's task died before producing a result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnnotationOutcome {
    /// Outcome for a record whose annotation task failed outright
    pub fn failed(index: usize, record: Record, error: impl Into<String>) -> Self {
        Self {
            index,
            status: OutcomeStatus::Failure,
            annotated: record.clone(),
            original: record,
            resolutions: Vec::new(),
            skipped_fields: Vec::new(),
            backend_errors: Vec::new(),
            cache_hits: 0,
            cache_misses: 0,
            duration_ms: 0,
            validation: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Attach validation findings
    pub fn with_validation(mut self, issues: Vec<ValidationIssue>) -> Self {
        self.validation = issues;
        self
    }

    /// Resolutions that ended with an accepted match
    pub fn matched(&self) -> impl Iterator<Item = &PhraseResolution> {
        self.resolutions.iter().filter(|r| r.chosen.is_some())
    }

    /// Resolutions that ended without a match
    pub fn missed(&self) -> impl Iterator<Item = &PhraseResolution> {
        self.resolutions.iter().filter(|r| r.chosen.is_none())
    }

    pub fn extraction_failures(&self) -> usize {
        self.skipped_fields
            .iter()
            .filter(|s| matches!(s.skip, FieldSkip::ExtractionFailed { .. }))
            .count()
    }
}
