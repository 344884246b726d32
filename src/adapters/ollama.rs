//! Ollama adapter for LLM-based phrase extraction.
//!
//! Sends the field text as the prompt to `/api/generate` and reads every
//! bracketed list (`[a, b, c]`) in the model's answer as phrases. A leading
//! `<think>...</think>` block emitted by reasoning models is discarded.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ExtractionBackend, ExtractionError};
use crate::domain::LanguageTag;

/// A bracketed, comma-separated list
const LIST_PATTERN: &str = r"\[(.*?)\]";

const DEFAULT_SYSTEM_PROMPT: &str = "Extract all noun phrases from the user's text. \
Answer with a single list in square brackets, items separated by commas, e.g. [noun phrase one, noun phrase two]. \
Keep each phrase exactly as written in the text.";

/// Configuration for the Ollama backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL of the Ollama server
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// System prompt
    #[serde(default = "default_system")]
    pub system: String,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Bearer token for proxied deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3.1".to_string()
}
fn default_system() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_timeout() -> u64 {
    60
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            model: default_model(),
            system: default_system(),
            temperature: 0.0,
            timeout_seconds: default_timeout(),
            api_key: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Phrase extraction through an Ollama server
pub struct OllamaBackend {
    config: OllamaConfig,
    client: reqwest::Client,
    list_pattern: Regex,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let list_pattern = Regex::new(LIST_PATTERN).context("Failed to compile list pattern")?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            list_pattern,
        })
    }

    /// Build API URL
    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn backend_error(&self, message: impl Into<String>) -> ExtractionError {
        ExtractionError::Backend {
            backend: self.name().to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl ExtractionBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn extract(&self, text: &str, _language: &LanguageTag) -> Result<Vec<String>, ExtractionError> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt: text,
            system: &self.config.system,
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
            },
        };

        let mut builder = self
            .client
            .post(self.api_url("generate"))
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| self.backend_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.backend_error(format!("HTTP status {}", status.as_u16())));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| ExtractionError::Unparsable {
            backend: self.name().to_string(),
            message: e.to_string(),
        })?;

        let answer = strip_think_block(&body.response);
        if !answer.contains('[') {
            return Err(ExtractionError::Unparsable {
                backend: self.name().to_string(),
                message: "no bracketed list in response".to_string(),
            });
        }

        Ok(parse_phrase_lists(&self.list_pattern, answer))
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(self.api_url("tags"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .with_context(|| format!("Ollama not reachable at {}", self.config.url))?;

        if !response.status().is_success() {
            anyhow::bail!("Ollama health check failed: HTTP {}", response.status());
        }
        Ok(())
    }
}

/// Drop a leading `<think>...</think>` block
pub fn strip_think_block(text: &str) -> &str {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<think>") {
        if let Some(end) = rest.find("</think>") {
            return rest[end + "</think>".len()..].trim();
        }
    }
    text.trim()
}

/// Collect the items of every `[..]` list, in order of appearance
pub fn parse_phrase_lists(pattern: &Regex, text: &str) -> Vec<String> {
    pattern
        .captures_iter(text)
        .flat_map(|caps| {
            caps[1]
                .split(',')
                .map(|item| item.trim().trim_matches(|c: char| c == '\'' || c == '"').trim().to_string())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}
