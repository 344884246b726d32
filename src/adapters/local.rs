//! Local noun-phrase chunker.
//!
//! Rule-based extraction without a model: text is cut into clauses at
//! punctuation, and every clause into runs of content words at stopwords
//! and numbers. Each run is a candidate phrase.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use super::{ExtractionBackend, ExtractionError};
use crate::domain::LanguageTag;

/// Characters that end a clause
const CLAUSE_SEPARATORS: &[char] = &[':', ',', '.', '(', ')', '[', ']', '=', ';', '!', '?', '\n'];

/// Characters trimmed off token edges
const TOKEN_TRIM: &[char] = &['"', '\'', '`', '*', '<', '>', '{', '}', '/', '\\', '|'];

const ENGLISH_STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any", "are", "as", "at",
    "be", "because", "been", "before", "being", "below", "between", "both", "but", "by", "can", "could", "did",
    "do", "does", "doing", "down", "during", "each", "either", "every", "few", "for", "from", "further", "had",
    "has", "have", "having", "he", "her", "here", "hers", "him", "his", "how", "i", "if", "in", "into", "is", "it",
    "its", "itself", "just", "may", "me", "might", "more", "most", "must", "my", "neither", "no", "nor", "not",
    "of", "off", "on", "once", "only", "or", "other", "our", "ours", "out", "over", "own", "per", "same", "shall",
    "she", "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them", "then", "there",
    "these", "they", "this", "those", "through", "to", "too", "under", "until", "up", "upon", "very", "via", "was",
    "we", "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with", "within",
    "without", "would", "you", "your", "yours",
];

const GERMAN_STOPWORDS: &[&str] = &[
    "aber", "alle", "allem", "allen", "aller", "als", "also", "am", "an", "auch", "auf", "aus", "bei", "beim",
    "bin", "bis", "bist", "da", "damit", "dann", "das", "dass", "dem", "den", "denn", "der", "des", "die", "dies",
    "diese", "diesem", "diesen", "dieser", "dieses", "doch", "dort", "du", "durch", "ein", "eine", "einem",
    "einen", "einer", "eines", "er", "es", "für", "gegen", "hat", "hatte", "hier", "hin", "ich", "ihr", "ihre",
    "im", "in", "ins", "ist", "ja", "jede", "jedem", "jeden", "jeder", "jedes", "kann", "kein", "keine", "mit",
    "nach", "nicht", "noch", "nun", "nur", "ob", "oder", "ohne", "sich", "sie", "sind", "so", "soll", "sowie",
    "über", "um", "und", "uns", "unter", "vom", "von", "vor", "war", "waren", "was", "weil", "wenn", "werden",
    "wie", "wir", "wird", "wo", "zu", "zum", "zur", "zwischen",
];

/// Stopword-based phrase chunker for English and German
pub struct LocalChunker {
    english: HashSet<&'static str>,
    german: HashSet<&'static str>,
}

impl Default for LocalChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalChunker {
    pub fn new() -> Self {
        Self {
            english: ENGLISH_STOPWORDS.iter().copied().collect(),
            german: GERMAN_STOPWORDS.iter().copied().collect(),
        }
    }

    fn stopwords(&self, language: &LanguageTag) -> Option<&HashSet<&'static str>> {
        match language.as_str() {
            "en" | "eng" | "english" => Some(&self.english),
            "de" | "ger" | "deu" | "german" => Some(&self.german),
            _ => None,
        }
    }

    /// Split text into content-word runs
    pub fn chunk(&self, text: &str, stopwords: &HashSet<&'static str>) -> Vec<String> {
        let mut phrases = Vec::new();

        for clause in text.split(CLAUSE_SEPARATORS) {
            let mut run: Vec<&str> = Vec::new();

            for token in clause.split_whitespace() {
                let word = token.trim_matches(TOKEN_TRIM);
                let lower = word.to_lowercase();
                let breaks_run = word.is_empty()
                    || stopwords.contains(lower.as_str())
                    || !word.chars().any(char::is_alphabetic);

                if breaks_run {
                    flush(&mut run, &mut phrases);
                } else {
                    run.push(word);
                }
            }
            flush(&mut run, &mut phrases);
        }

        phrases
    }
}

fn flush(run: &mut Vec<&str>, phrases: &mut Vec<String>) {
    if !run.is_empty() {
        phrases.push(run.join(" "));
        run.clear();
    }
}

#[async_trait]
impl ExtractionBackend for LocalChunker {
    fn name(&self) -> &str {
        "local"
    }

    async fn extract(&self, text: &str, language: &LanguageTag) -> Result<Vec<String>, ExtractionError> {
        let stopwords = self
            .stopwords(language)
            .ok_or_else(|| ExtractionError::UnsupportedLanguage {
                backend: self.name().to_string(),
                language: language.to_string(),
            })?;

        Ok(self.chunk(text, stopwords))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
