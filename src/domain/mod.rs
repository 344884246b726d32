//! Domain types for the annotation engine.
//!
//! This module contains the core data structures:
//! - Record / Phrase: units of text and the spans extracted from them
//! - Matches: sources, normalized candidate matches, lookup keys
//! - Outcome: per-record annotation results

pub mod matches;
pub mod outcome;
pub mod record;

// Re-export commonly used types
pub use matches::{
    CandidateMatch, LookupKey, ResponseShape, SearchResult, SourceError, SourceFailure, SourceId, SourceScope,
    SourceSpec,
};
pub use outcome::{
    AnnotationOutcome, AnnotationState, FieldSkip, LookupOrigin, OutcomeStatus, PhraseResolution, SkippedField,
    ValidationIssue,
};
pub use record::{normalize, LanguageTag, Phrase, Record};
