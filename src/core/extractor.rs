//! Phrase extractor over pluggable backends.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::adapters::{ExtractionBackend, ExtractionError};
use crate::core::merge::phrase_pattern;
use crate::domain::{normalize, LanguageTag, Phrase};

/// Phrases found in one field
#[derive(Debug, Default)]
pub struct Extraction {
    pub phrases: Vec<Phrase>,

    /// Backends that failed while others answered
    pub failed_backends: Vec<String>,
}

/// Runs every configured backend on a field and unions their phrases
pub struct PhraseExtractor {
    backends: Vec<Arc<dyn ExtractionBackend>>,
    min_length: usize,
}

impl PhraseExtractor {
    pub fn new(backends: Vec<Arc<dyn ExtractionBackend>>, min_length: usize) -> Self {
        Self { backends, min_length }
    }

    pub fn backends(&self) -> &[Arc<dyn ExtractionBackend>] {
        &self.backends
    }

    /// Extract phrases from one field.
    ///
    /// Returns phrases deduplicated by normalized text in first-occurrence
    /// order, each carrying its surface form as written in `text`. Blank
    /// text yields no phrases. Fails only when every backend failed.
    pub async fn extract(&self, text: &str, field: &str, language: &LanguageTag) -> Result<Extraction, ExtractionError> {
        if text.trim().is_empty() {
            return Ok(Extraction::default());
        }
        if self.backends.is_empty() {
            return Err(ExtractionError::NoBackend);
        }

        let results = join_all(self.backends.iter().map(|b| b.extract(text, language))).await;

        let mut candidates = Vec::new();
        let mut errors = Vec::new();
        let mut failed_backends = Vec::new();
        for (backend, result) in self.backends.iter().zip(results) {
            match result {
                Ok(found) => candidates.extend(found),
                Err(e) => {
                    warn!(backend = backend.name(), field, error = %e, "Extraction backend failed");
                    failed_backends.push(backend.name().to_string());
                    errors.push(e);
                }
            }
        }

        if errors.len() == self.backends.len() {
            return Err(match errors.len() {
                1 => errors.remove(0),
                _ => ExtractionError::AllFailed(
                    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "),
                ),
            });
        }

        let mut seen = HashSet::new();
        let mut phrases = Vec::new();
        for candidate in candidates {
            let candidate = candidate.trim();
            if candidate.chars().count() < self.min_length {
                continue;
            }
            if !seen.insert(normalize(candidate)) {
                continue;
            }
            match locate(text, candidate) {
                Some(surface) => phrases.push(Phrase::new(surface, field, language.clone())),
                None => debug!(field, phrase = candidate, "Extracted phrase not found in text, dropped"),
            }
        }

        Ok(Extraction {
            phrases,
            failed_backends,
        })
    }
}

/// Find `phrase` in `text` ignoring case and whitespace differences,
/// returning the span as written in the text
pub fn locate(text: &str, phrase: &str) -> Option<String> {
    let pattern = phrase_pattern(phrase)?;
    pattern.find(text).map(|m| m.as_str().to_string())
}
