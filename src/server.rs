//! Interactive annotation API.
//!
//! Endpoints:
//! - `POST /annotate` `{text, language?, terminologies?}` -> `{np_collection, annotations, content}`
//! - `GET /api/terminologies` -> sorted terminology ids of the service
//! - `GET /health`
//!
//! Every request is annotated synchronously as a one-field record through
//! the same engine, cache and statistics as batch runs. Errors are answered
//! with `{error}` and a 4xx/5xx status.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::adapters::list_terminologies;
use crate::core::Orchestrator;
use crate::domain::{
    AnnotationOutcome, CandidateMatch, FieldSkip, LanguageTag, OutcomeStatus, SourceFailure, SourceId,
};

/// Shared handler state
#[derive(Clone)]
pub struct ServerState {
    engine: Arc<Orchestrator>,
    http: reqwest::Client,
    ts_base_url: String,
    default_language: LanguageTag,
}

impl ServerState {
    pub fn new(engine: Arc<Orchestrator>, ts_base_url: impl Into<String>, default_language: LanguageTag) -> Self {
        Self {
            engine,
            http: reqwest::Client::new(),
            ts_base_url: ts_base_url.into(),
            default_language,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnnotateRequest {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Terminology ids to search instead of the configured sources
    #[serde(default)]
    pub terminologies: Option<Vec<String>>,
}

/// One recognized phrase with its ranked candidates and the chosen match
#[derive(Debug, Serialize, Deserialize)]
pub struct PhraseAnnotation {
    pub phrase: String,
    pub chosen: Option<CandidateMatch>,
    pub matches: Vec<CandidateMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_failures: Vec<SourceFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnnotateResponse {
    /// Recognized phrases in order of appearance
    pub np_collection: Vec<String>,
    pub annotations: Vec<PhraseAnnotation>,
    /// Text with match markers merged in
    pub content: String,
    pub status: OutcomeStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TerminologyListResponse {
    pub terminologies: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: error.into() })).into_response()
}

impl From<AnnotationOutcome> for AnnotateResponse {
    fn from(outcome: AnnotationOutcome) -> Self {
        let content = outcome
            .annotated
            .get(crate::core::INTERACTIVE_FIELD)
            .unwrap_or_default()
            .to_string();

        let annotations: Vec<PhraseAnnotation> = outcome
            .resolutions
            .into_iter()
            .map(|r| PhraseAnnotation {
                phrase: r.phrase.surface,
                chosen: r.chosen,
                matches: r.candidates.to_vec(),
                source_failures: r.source_failures,
                error: r.error,
            })
            .collect();

        Self {
            np_collection: annotations.iter().map(|a| a.phrase.clone()).collect(),
            annotations,
            content,
            status: outcome.status,
        }
    }
}

/// Reason a failed outcome produced nothing
fn failure_reason(outcome: &AnnotationOutcome) -> String {
    if let Some(error) = &outcome.error {
        return error.clone();
    }
    outcome
        .skipped_fields
        .iter()
        .find_map(|s| match &s.skip {
            FieldSkip::ExtractionFailed { error } => Some(format!("extraction failed: {error}")),
            _ => None,
        })
        .or_else(|| outcome.resolutions.iter().find_map(|r| r.error.clone()))
        .unwrap_or_else(|| "annotation failed".to_string())
}

/// POST /annotate
async fn annotate(State(state): State<ServerState>, payload: Result<Json<AnnotateRequest>, JsonRejection>) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    if request.text.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "text must not be empty");
    }

    let language = request
        .language
        .as_deref()
        .map(LanguageTag::new)
        .unwrap_or_else(|| state.default_language.clone());

    let sources = match request.terminologies {
        Some(selected) => {
            let ids: Vec<SourceId> = selected
                .iter()
                .map(|id| id.trim())
                .filter(|id| !id.is_empty())
                .map(SourceId::from)
                .collect();
            if let Err(e) = state.engine.check_selection(&ids) {
                return error_response(StatusCode::BAD_REQUEST, e.to_string());
            }
            ids
        }
        None => state.engine.source_ids(),
    };

    let outcome = state.engine.annotate_text_in(&request.text, language, sources).await;
    if outcome.status == OutcomeStatus::Failure {
        let reason = failure_reason(&outcome);
        warn!(error = %reason, "Interactive annotation failed");
        return error_response(StatusCode::BAD_GATEWAY, reason);
    }

    Json(AnnotateResponse::from(outcome)).into_response()
}

/// GET /api/terminologies
async fn terminologies(State(state): State<ServerState>) -> Response {
    match list_terminologies(&state.http, &state.ts_base_url).await {
        Ok(terminologies) => Json(TerminologyListResponse { terminologies }).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, format!("{e:#}")),
    }
}

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// Build the API router
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/annotate", post(annotate))
        .route("/api/terminologies", get(terminologies))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = listener.local_addr().context("Failed to read listener address")?;
    info!(%address, "Annotation server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Annotation server failed")
}

/// Bind `address` and serve until Ctrl-C
pub async fn run(address: &str, state: ServerState) -> Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;

    serve(listener, state, async {
        if tokio::signal::ctrl_c().await.is_err() {
            // Without a signal handler the server runs until killed
            std::future::pending::<()>().await;
        }
    })
    .await
}
