//! Structural checks on merged records.
//!
//! Findings are advisory: they are counted and attached to the outcome but
//! never stop a record from being exported.

use std::collections::HashSet;

use crate::core::merge::scan;
use crate::domain::{normalize, AnnotationOutcome, ValidationIssue};

/// Check every field of an outcome's annotated record against the original,
/// and every chosen match against the markers of its field
pub fn validate(outcome: &AnnotationOutcome) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut placed = HashSet::new();

    for (field, original) in outcome.original.fields() {
        let Some(merged) = outcome.annotated.get(field) else {
            issues.push(ValidationIssue::MissingField {
                field: field.to_string(),
            });
            continue;
        };

        let (stripped, markers) = scan(merged);
        if stripped != original {
            issues.push(ValidationIssue::DataLoss {
                field: field.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for marker in markers {
            let marker = match marker {
                Ok(marker) => marker,
                Err(detail) => {
                    issues.push(ValidationIssue::MalformedMarker {
                        field: field.to_string(),
                        detail,
                    });
                    continue;
                }
            };

            if marker.iri.trim().is_empty() {
                issues.push(ValidationIssue::MissingIdentifier {
                    field: field.to_string(),
                    phrase: marker.phrase.clone(),
                });
            }
            if marker.label.trim().is_empty() {
                issues.push(ValidationIssue::MissingLabel {
                    field: field.to_string(),
                    phrase: marker.phrase.clone(),
                });
            }
            placed.insert((field, normalize(&marker.phrase), marker.iri.clone()));
            if !seen.insert((marker.phrase.clone(), marker.iri.clone())) {
                issues.push(ValidationIssue::DuplicateMatch {
                    field: field.to_string(),
                    entity_id: marker.iri,
                });
            }
        }
    }

    for resolution in &outcome.resolutions {
        let Some(chosen) = &resolution.chosen else {
            continue;
        };
        let phrase = &resolution.phrase;
        if !placed.contains(&(phrase.field.as_str(), phrase.normalized.clone(), chosen.entity_id.clone())) {
            issues.push(ValidationIssue::UnplacedMatch {
                field: phrase.field.clone(),
                phrase: phrase.surface.clone(),
            });
        }
    }

    issues
}

/// Output must hold one row per processed input row
pub fn validate_row_count(expected: usize, actual: usize) -> Option<ValidationIssue> {
    (expected != actual).then_some(ValidationIssue::RowCountMismatch { expected, actual })
}
