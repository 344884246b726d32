//! Adapter interfaces for external systems.
//!
//! Two capabilities are consumed by the engine: extracting candidate
//! phrases from text, and searching a terminology source for a phrase.
//! Each backend implements one trait and is selected by configuration when
//! the engine is built.

pub mod local;
pub mod ollama;
pub mod tib;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::core::shapes::SourceResponseShape;
use crate::domain::{LanguageTag, SourceError, SourceSpec};

pub use local::LocalChunker;
pub use ollama::{OllamaBackend, OllamaConfig};
pub use tib::{list_terminologies, TibSource, DEFAULT_TS_URL};

/// Errors from a phrase extraction backend
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("no extraction backend configured")]
    NoBackend,

    #[error("backend '{backend}' does not support language '{language}'")]
    UnsupportedLanguage { backend: String, language: String },

    #[error("backend '{backend}' request failed: {message}")]
    Backend { backend: String, message: String },

    #[error("backend '{backend}' returned an unusable response: {message}")]
    Unparsable { backend: String, message: String },

    #[error("all extraction backends failed: {0}")]
    AllFailed(String),
}

/// A noun-phrase extraction backend
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Extract candidate phrases, in order of appearance
    async fn extract(&self, text: &str, language: &LanguageTag) -> Result<Vec<String>, ExtractionError>;

    /// Health check (for remote backends)
    async fn health_check(&self) -> Result<()>;
}

/// A terminology source that can be searched for a phrase
#[async_trait]
pub trait TerminologySource: Send + Sync {
    /// Source configuration (id, scope, response shape)
    fn spec(&self) -> &SourceSpec;

    /// Run one search request and parse the body into its response shape
    async fn search(&self, phrase: &str, language: &LanguageTag) -> Result<SourceResponseShape, SourceError>;

    /// Health check
    async fn health_check(&self) -> Result<()>;
}
