//! TIB terminology service adapter.
//!
//! One `TibSource` per configured source. Search-shaped sources call the
//! Solr-backed `/search` endpoint, scoped to an ontology, a collection or
//! nothing; entity-shaped sources call `/v2/entities`. All sources share one
//! `reqwest::Client` and therefore one connection pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::TerminologySource;
use crate::core::shapes::SourceResponseShape;
use crate::domain::{LanguageTag, ResponseShape, SourceError, SourceScope, SourceSpec};

/// Public TIB terminology service
pub const DEFAULT_TS_URL: &str = "https://api.terminology.tib.eu/api";

/// A terminology source on a TIB/OLS-compatible service
pub struct TibSource {
    spec: SourceSpec,
    base_url: String,
    rows: u32,
    client: reqwest::Client,
}

impl TibSource {
    pub fn new(spec: SourceSpec, base_url: impl Into<String>, rows: u32, client: reqwest::Client) -> Self {
        Self {
            spec,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rows,
            client,
        }
    }

    /// Build API URL
    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Endpoint and query parameters for one phrase
    fn request(&self, phrase: &str, language: &LanguageTag) -> (String, Vec<(&'static str, String)>) {
        match self.spec.shape {
            ResponseShape::Search => {
                let mut query = vec![
                    ("q", phrase.to_string()),
                    ("rows", self.rows.to_string()),
                    ("lang", language.to_string()),
                ];
                match &self.spec.scope {
                    SourceScope::Ontology(name) => query.push(("ontology", name.clone())),
                    SourceScope::Collection(name) => {
                        query.push(("schema", "collection".to_string()));
                        query.push(("classification", name.clone()));
                    }
                    SourceScope::All => {}
                }
                (self.api_url("search"), query)
            }
            ResponseShape::Entities => {
                let mut query = vec![
                    ("search", phrase.to_string()),
                    ("size", self.rows.to_string()),
                    ("lang", language.to_string()),
                ];
                if let SourceScope::Ontology(name) = &self.spec.scope {
                    query.push(("ontologyId", name.clone()));
                }
                (self.api_url("v2/entities"), query)
            }
        }
    }
}

fn transport_error(error: reqwest::Error) -> SourceError {
    match error.status() {
        Some(status) => SourceError::Status {
            status: status.as_u16(),
        },
        None => SourceError::Transport {
            message: error.to_string(),
        },
    }
}

#[async_trait]
impl TerminologySource for TibSource {
    fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    async fn search(&self, phrase: &str, language: &LanguageTag) -> Result<SourceResponseShape, SourceError> {
        let (url, query) = self.request(phrase, language);

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport_error)?;
        SourceResponseShape::parse(self.spec.shape, &body)
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(self.api_url("v2/ontologies"))
            .query(&[("size", "1")])
            .send()
            .await
            .with_context(|| format!("Terminology service not reachable at {}", self.base_url))?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Terminology source '{}' health check failed: HTTP {}",
                self.spec.id,
                response.status()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct OntologyPage {
    #[serde(default)]
    elements: Vec<OntologyElement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OntologyElement {
    ontology_id: Option<String>,
}

/// List every terminology id the service offers, sorted
pub async fn list_terminologies(client: &reqwest::Client, base_url: &str) -> Result<Vec<String>> {
    let url = format!("{}/v2/ontologies", base_url.trim_end_matches('/'));

    let response = client
        .get(&url)
        .query(&[("size", "1000")])
        .send()
        .await
        .with_context(|| format!("Failed to request terminology list from {}", url))?;

    if !response.status().is_success() {
        anyhow::bail!("Terminology list request failed: HTTP {}", response.status());
    }

    let page: OntologyPage = response
        .json()
        .await
        .context("Failed to parse terminology list")?;

    let mut ids: Vec<String> = page.elements.into_iter().filter_map(|e| e.ontology_id).collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}
