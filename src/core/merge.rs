//! Textual encoding of matches inside field values.
//!
//! A matched phrase is followed by one space and a JSON marker:
//!
//! ```text
//! stored in carbon dioxide {"@match":{"phrase":"carbon dioxide","source":"chebi","id":"CHEBI_16526","iri":"http://purl.obolibrary.org/obo/CHEBI_16526","label":"carbon dioxide","score":1.0}} at 4 degrees
//! ```
//!
//! Removing every marker (including its leading space) gives back the
//! original value byte for byte. A value without matches is left untouched.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::domain::CandidateMatch;

const MARKER_PREFIX: &str = " {\"@match\":";

/// Match metadata embedded after a phrase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchMarker {
    pub phrase: String,
    pub source: String,
    /// Short identifier
    pub id: String,
    pub iri: String,
    pub label: String,
    pub score: f64,
}

impl MatchMarker {
    pub fn new(phrase: &str, candidate: &CandidateMatch) -> Self {
        Self {
            phrase: phrase.to_string(),
            source: candidate.source.to_string(),
            id: candidate.short_id.clone(),
            iri: candidate.entity_id.clone(),
            label: candidate.primary_label().to_string(),
            score: (candidate.score * 1000.0).round() / 1000.0,
        }
    }

    fn encode(&self) -> String {
        let envelope = MarkerEnvelope { inner: self.clone() };
        // Serializing plain strings and a finite float cannot fail
        serde_json::to_string(&envelope).unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize)]
struct MarkerEnvelope {
    #[serde(rename = "@match")]
    inner: MatchMarker,
}

/// Insert a marker after the first free occurrence of each phrase.
///
/// Longer phrases claim their span first, so `metal oxide` is annotated
/// before `metal`, and a shorter phrase never matches inside a claimed span.
/// Occurrences ignore case and whitespace differences and must sit on word
/// boundaries; the marker records the phrase as written at that occurrence.
/// A phrase with no free occurrence gets no marker.
pub fn merge_field(text: &str, matches: &[(&str, &CandidateMatch)]) -> String {
    let mut ordered: Vec<&(&str, &CandidateMatch)> = matches.iter().collect();
    ordered.sort_by_key(|(surface, _)| std::cmp::Reverse(surface.chars().count()));

    let mut claims: Vec<(usize, usize, MatchMarker)> = Vec::new();
    for (surface, candidate) in ordered {
        let free = occurrences(text, surface).into_iter().find(|(start, end)| {
            claims
                .iter()
                .all(|(claimed_start, claimed_end, _)| *end <= *claimed_start || *start >= *claimed_end)
        });
        if let Some((start, end)) = free {
            claims.push((start, end, MatchMarker::new(&text[start..end], candidate)));
        }
    }

    if claims.is_empty() {
        return text.to_string();
    }
    claims.sort_by_key(|(start, _, _)| *start);

    let mut merged = String::with_capacity(text.len() + claims.len() * 160);
    let mut cursor = 0;
    for (_, end, marker) in &claims {
        merged.push_str(&text[cursor..*end]);
        merged.push(' ');
        merged.push_str(&marker.encode());
        cursor = *end;
    }
    merged.push_str(&text[cursor..]);
    merged
}

/// Byte ranges where `phrase` occurs in `text`, in order
fn occurrences(text: &str, phrase: &str) -> Vec<(usize, usize)> {
    phrase_pattern(phrase)
        .map(|pattern| pattern.find_iter(text).map(|m| (m.start(), m.end())).collect())
        .unwrap_or_default()
}

/// Case-insensitive pattern for a phrase. Any whitespace run matches any
/// other, and alphanumeric ends must sit on word boundaries.
pub(crate) fn phrase_pattern(phrase: &str) -> Option<Regex> {
    let tokens: Vec<String> = phrase.split_whitespace().map(regex::escape).collect();
    if tokens.is_empty() {
        return None;
    }

    let mut pattern = tokens.join(r"\s+");
    if phrase.trim_start().starts_with(char::is_alphanumeric) {
        pattern.insert_str(0, r"\b");
    }
    if phrase.trim_end().ends_with(char::is_alphanumeric) {
        pattern.push_str(r"\b");
    }

    RegexBuilder::new(&pattern).case_insensitive(true).build().ok()
}

/// A marker found in a merged value, or why it could not be read
pub type ParsedMarker = Result<MatchMarker, String>;

/// Split a merged value into its original text and its markers
pub fn scan(merged: &str) -> (String, Vec<ParsedMarker>) {
    let mut stripped = String::with_capacity(merged.len());
    let mut markers = Vec::new();
    let mut rest = merged;

    while let Some(pos) = rest.find(MARKER_PREFIX) {
        stripped.push_str(&rest[..pos]);
        let json = &rest[pos + 1..];

        let mut stream = serde_json::Deserializer::from_str(json).into_iter::<MarkerEnvelope>();
        match stream.next() {
            Some(Ok(envelope)) => {
                markers.push(Ok(envelope.inner));
                rest = &json[stream.byte_offset()..];
            }
            other => {
                let detail = match other {
                    Some(Err(e)) => e.to_string(),
                    _ => "unterminated marker".to_string(),
                };
                markers.push(Err(detail));
                // Keep the unreadable text so the data-loss check sees it
                stripped.push_str(&rest[pos..pos + MARKER_PREFIX.len()]);
                rest = &rest[pos + MARKER_PREFIX.len()..];
            }
        }
    }

    stripped.push_str(rest);
    (stripped, markers)
}

/// Remove every marker from a merged value
pub fn strip_markers(merged: &str) -> String {
    scan(merged).0
}

/// Read every marker in a merged value
pub fn parse_markers(merged: &str) -> Vec<ParsedMarker> {
    scan(merged).1
}
