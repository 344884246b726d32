//! Terminology response shapes and their normalization.
//!
//! Sources answer in one of two layouts. Each body is parsed into an
//! explicit variant of [`SourceResponseShape`], then every variant is mapped
//! into the canonical [`CandidateMatch`]:
//!
//! | | Search (shape A) | Entities (shape B) |
//! |---|---|---|
//! | results | `response.docs` (with `numFound`, `start`) | `elements` |
//! | key style | snake_case | camelCase |
//! | label / type | single string | array |
//! | ontology | `ontology_name` | `ontologyId` |
//! | short id | `short_form` / `obo_id` / `id` | `shortForm` / `curie` |

use serde::Deserialize;

use crate::domain::{normalize, CandidateMatch, ResponseShape, SourceError, SourceId};

/// A field that some sources send as a string and others as an array
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

fn flatten(value: Option<OneOrMany>) -> Vec<String> {
    value
        .map(OneOrMany::into_vec)
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Shape A: Solr-style search response
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    pub response: SearchBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchBody {
    #[serde(rename = "numFound", default)]
    pub num_found: u64,
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub docs: Vec<SearchDoc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchDoc {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub iri: Option<String>,
    #[serde(default)]
    pub short_form: Option<String>,
    #[serde(default)]
    pub obo_id: Option<String>,
    #[serde(default)]
    pub label: Option<OneOrMany>,
    #[serde(default)]
    pub synonym: Option<OneOrMany>,
    #[serde(default)]
    pub ontology_name: Option<String>,
    #[serde(default, rename = "type")]
    pub entity_type: Option<OneOrMany>,
    #[serde(default)]
    pub is_obsolete: Option<bool>,
    #[serde(default)]
    pub is_defining_ontology: Option<bool>,
}

/// Shape B: entity listing response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitiesResponse {
    pub elements: Vec<EntityElement>,
    #[serde(default)]
    pub total_elements: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityElement {
    #[serde(default)]
    pub iri: Option<String>,
    #[serde(default)]
    pub short_form: Option<String>,
    #[serde(default)]
    pub curie: Option<String>,
    #[serde(default)]
    pub label: Option<OneOrMany>,
    #[serde(default)]
    pub synonym: Option<OneOrMany>,
    #[serde(default)]
    pub ontology_id: Option<String>,
    #[serde(default, rename = "type")]
    pub entity_type: Option<OneOrMany>,
    #[serde(default)]
    pub is_obsolete: Option<bool>,
    #[serde(default)]
    pub is_defining_ontology: Option<bool>,
}

/// A parsed source response, one variant per known layout
#[derive(Debug, Clone)]
pub enum SourceResponseShape {
    Search(SearchResponse),
    Entities(EntitiesResponse),
}

/// Shape-independent intermediate before validation and scoring
struct RawHit {
    iri: String,
    short_id: String,
    labels: Vec<String>,
    synonyms: Vec<String>,
    types: Vec<String>,
    ontology: Option<String>,
    obsolete: bool,
    defining: Option<bool>,
}

impl From<SearchDoc> for RawHit {
    fn from(doc: SearchDoc) -> Self {
        let iri = doc.iri.unwrap_or_default();
        let short_id = doc
            .short_form
            .or(doc.obo_id)
            .or(doc.id)
            .unwrap_or_else(|| iri_tail(&iri));
        Self {
            short_id,
            labels: flatten(doc.label),
            synonyms: flatten(doc.synonym),
            types: flatten(doc.entity_type),
            ontology: doc.ontology_name,
            obsolete: doc.is_obsolete.unwrap_or(false),
            defining: doc.is_defining_ontology,
            iri,
        }
    }
}

impl From<EntityElement> for RawHit {
    fn from(element: EntityElement) -> Self {
        let iri = element.iri.unwrap_or_default();
        let short_id = element
            .short_form
            .or(element.curie)
            .unwrap_or_else(|| iri_tail(&iri));
        Self {
            short_id,
            labels: flatten(element.label),
            synonyms: flatten(element.synonym),
            types: flatten(element.entity_type),
            ontology: element.ontology_id,
            obsolete: element.is_obsolete.unwrap_or(false),
            defining: element.is_defining_ontology,
            iri,
        }
    }
}

impl RawHit {
    fn into_candidate(self, source: &SourceId, phrase: &str) -> Option<CandidateMatch> {
        let score = self
            .labels
            .iter()
            .chain(self.synonyms.iter())
            .map(|label| similarity(phrase, label))
            .fold(0.0_f64, f64::max);

        let candidate = CandidateMatch {
            source: source.clone(),
            entity_id: self.iri.trim().to_string(),
            short_id: self.short_id,
            labels: self.labels,
            entity_types: self.types,
            ontology: self.ontology,
            score,
            obsolete: self.obsolete,
            defining_ontology: self.defining,
        };

        candidate.is_valid().then_some(candidate)
    }
}

/// Last path segment of an IRI, used when a source sends no short id
fn iri_tail(iri: &str) -> String {
    iri.rsplit(['/', '#']).next().unwrap_or_default().to_string()
}

impl SourceResponseShape {
    /// Parse a response body according to the source's declared shape
    pub fn parse(shape: ResponseShape, body: &str) -> Result<Self, SourceError> {
        let parsed = match shape {
            ResponseShape::Search => serde_json::from_str(body).map(Self::Search),
            ResponseShape::Entities => serde_json::from_str(body).map(Self::Entities),
        };
        parsed.map_err(|e| SourceError::Malformed {
            message: e.to_string(),
        })
    }

    /// Number of hits the source reports in total
    pub fn total(&self) -> u64 {
        match self {
            Self::Search(r) => r.response.num_found,
            Self::Entities(r) => r.total_elements.max(r.elements.len() as u64),
        }
    }

    /// Map to canonical candidates in upstream order.
    ///
    /// Hits without an identifier or label are dropped here, so they never
    /// reach the cache.
    pub fn into_candidates(self, source: &SourceId, phrase: &str) -> Vec<CandidateMatch> {
        let raw: Vec<RawHit> = match self {
            Self::Search(r) => r.response.docs.into_iter().map(RawHit::from).collect(),
            Self::Entities(r) => r.elements.into_iter().map(RawHit::from).collect(),
        };

        raw.into_iter()
            .filter_map(|hit| hit.into_candidate(source, phrase))
            .collect()
    }
}

/// Similarity of a phrase and a label: Sørensen-Dice over character
/// bigrams of the normalized text. Identical strings score 1.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::sorensen_dice(&normalize(a), &normalize(b))
}
