//! Records, phrases and language tags.
//!
//! A record is the unit of annotation: an ordered mapping of field name to
//! text value. Field order is preserved through deserialization, annotation
//! and serialization so exported rows line up with the input.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

/// Language tag used to pick extraction rules and scope lookups (e.g. "en", "de").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageTag(String);

impl LanguageTag {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_lowercase())
    }

    pub fn english() -> Self {
        Self::new("en")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LanguageTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize phrase text for comparison and cache keys.
///
/// Lowercases and collapses every whitespace run to a single space, so two
/// phrases that differ only in case or spacing normalize to the same string.
/// Applying it twice yields the same result as applying it once.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A candidate span extracted from one field of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phrase {
    /// Text as it appears in the field
    pub surface: String,

    /// Normalized form used for deduplication and lookup
    pub normalized: String,

    /// Field the phrase was extracted from
    pub field: String,

    /// Language the field was extracted in
    pub language: LanguageTag,
}

impl Phrase {
    pub fn new(surface: impl Into<String>, field: impl Into<String>, language: LanguageTag) -> Self {
        let surface = surface.into();
        let normalized = normalize(&surface);
        Self {
            surface,
            normalized,
            field: field.into(),
            language,
        }
    }
}

/// One unit to annotate (e.g. one dataset row).
///
/// Identity is the record's position in the input sequence, which the
/// orchestrator carries alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: IndexMap<String, String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from ordered (field, value) pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Get a field value
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Set a field value, keeping the field's position if it already exists
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Iterate fields in order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = IndexMap::<String, serde_json::Value>::deserialize(deserializer)?;

        // Tabular exports mix numbers and nulls into text columns
        let fields = raw
            .into_iter()
            .map(|(field, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (field, text)
            })
            .collect();

        Ok(Self { fields })
    }
}
