//! Core annotation engine.
//!
//! This module contains:
//! - Shapes: terminology response layouts and their normalization
//! - TerminologyClient: fan-out search with retry and failure isolation
//! - LookupCache: single-flight, staleness-bounded lookup cache
//! - PhraseExtractor: backend union over a field's text
//! - Annotator: per-record state machine
//! - Merge / Validator: textual match encoding and its structural checks
//! - Statistics: process-wide counters
//! - Orchestrator: bounded, order-preserving batch execution

pub mod annotator;
pub mod cache;
pub mod extractor;
pub mod merge;
pub mod orchestrator;
pub mod retry;
pub mod shapes;
pub mod statistics;
pub mod terminology;
pub mod validator;

// Re-export commonly used types
pub use annotator::{AnnotationPolicy, Annotator, FieldLanguages, RecordPlan};
pub use cache::{CacheComputeError, CacheEntry, Lookup, LookupCache, LookupFailure, Resolved, DEFAULT_STALENESS};
pub use extractor::{Extraction, PhraseExtractor};
pub use merge::{merge_field, parse_markers, strip_markers, MatchMarker};
pub use orchestrator::{EngineSettings, HealthStatus, Orchestrator, StopSignal, INTERACTIVE_FIELD};
pub use retry::RetryPolicy;
pub use shapes::{similarity, SourceResponseShape};
pub use statistics::{StatisticsCollector, StatisticsSnapshot};
pub use terminology::{SearchError, SourceFactory, TerminologyClient};
pub use validator::{validate, validate_row_count};
