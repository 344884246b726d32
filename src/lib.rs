//! termtagger - Concurrent controlled-vocabulary annotation engine
//!
//! Reads free-text records, extracts candidate noun phrases, looks each
//! phrase up in one or more terminology services and merges the best match
//! back into the text as an inline marker.
//!
//! # Architecture
//!
//! - Records are annotated concurrently by a bounded pool of tasks
//! - Phrase lookups go through a shared cache that computes each key once,
//!   even when many records ask for it at the same time
//! - A failing source, backend or record degrades the result but never
//!   aborts the batch
//!
//! # Modules
//!
//! - `adapters`: Extraction backends (local chunker, Ollama) and terminology sources (TIB)
//! - `core`: Orchestration logic (Orchestrator, Annotator, LookupCache, TerminologyClient)
//! - `domain`: Data structures (Record, CandidateMatch, AnnotationOutcome)
//! - `config`: YAML configuration and validation
//! - `server`: Interactive HTTP API
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Annotate a batch of records
//! termtagger annotate --input rows.json --output annotated.json
//!
//! # Serve the interactive API
//! termtagger serve --address 127.0.0.1:9000
//!
//! # Check backends and sources
//! termtagger check
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod server;

// Re-export main types at crate root for convenience
pub use core::{Annotator, LookupCache, Orchestrator, TerminologyClient};
pub use domain::{AnnotationOutcome, CandidateMatch, LanguageTag, OutcomeStatus, Record};
