//! Configuration for termtagger.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TERMTAGGER_HOME, TERMTAGGER_TS_URL)
//! 2. Config file (`--config <path>` or a discovered .termtagger/config.yaml)
//! 3. Defaults (~/.termtagger, public TIB terminology service)
//!
//! Config file discovery:
//! - Searches current directory and parents for .termtagger/config.yaml
//! - `home` in the config file is relative to the .termtagger directory
//!
//! The resolved configuration is validated before any record is processed.
//! Every violation is a [`ConfigError`] and aborts the run.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::{OllamaConfig, DEFAULT_TS_URL};
use crate::core::retry::RetryPolicy;
use crate::domain::{ResponseShape, SourceId, SourceSpec};

/// Name of the per-project configuration directory
pub const CONFIG_DIR: &str = ".termtagger";

/// Fatal configuration problems
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("no terminology source configured (set ts_sources.explicit_terminologies, collection or all_terminologies)")]
    NoTerminologySource,

    #[error("no extraction backend configured")]
    NoExtractionBackend,

    #[error("no relevant field configured (annotation.relevant_fields)")]
    NoRelevantField,

    #[error("invalid ignore pattern '{pattern}': {message}")]
    InvalidIgnorePattern { pattern: String, message: String },

    #[error("max_threads must be at least 1")]
    ZeroThreads,

    #[error("min_score must be between 0.0 and 1.0, got {0}")]
    InvalidMinScore(f64),

    #[error("terminology '{0}' collides with the collection or all-terminologies source id")]
    DuplicateSourceId(String),
}

/// Config file schema (matches YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// State directory (relative to the .termtagger directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,

    #[serde(default)]
    pub annotation: AnnotationSettings,

    #[serde(default)]
    pub ts_sources: SourceSettings,

    #[serde(default)]
    pub extraction: ExtractionSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    /// Worker pool size (defaults to detected parallelism)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_threads: Option<usize>,

    #[serde(default = "default_true")]
    pub persist_statistics: bool,

    /// Save the cache every N completed records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_every: Option<usize>,

    #[serde(default)]
    pub server: ServerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home: None,
            annotation: AnnotationSettings::default(),
            ts_sources: SourceSettings::default(),
            extraction: ExtractionSettings::default(),
            cache: CacheSettings::default(),
            max_threads: None,
            persist_statistics: true,
            checkpoint_every: None,
            server: ServerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationSettings {
    /// Language tag -> fields annotated in that language
    #[serde(default)]
    pub relevant_fields: BTreeMap<String, Vec<String>>,

    /// Glob patterns over field names that are never extracted
    #[serde(default)]
    pub ignore_fields: Vec<String>,

    /// Cell values that are never extracted (e.g. "n/a")
    #[serde(default)]
    pub ignore_cell_value: Vec<String>,

    /// Only annotate this many records from the start of the input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,

    /// Acceptance threshold for the top-ranked match
    #[serde(default)]
    pub min_score: f64,

    #[serde(default = "default_min_phrase_length")]
    pub min_phrase_length: usize,

    /// Language of interactive requests that do not name one
    #[serde(default = "default_language")]
    pub default_language: String,
}

impl Default for AnnotationSettings {
    fn default() -> Self {
        Self {
            relevant_fields: BTreeMap::new(),
            ignore_fields: Vec::new(),
            ignore_cell_value: Vec::new(),
            max_iterations: None,
            min_score: 0.0,
            min_phrase_length: default_min_phrase_length(),
            default_language: default_language(),
        }
    }
}

/// A terminology listed by name, or with an explicit response shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TerminologyEntry {
    Name(String),
    Detailed {
        id: String,
        #[serde(default)]
        shape: ResponseShape,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(default)]
    pub explicit_terminologies: Vec<TerminologyEntry>,

    /// Named collection of terminologies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,

    /// Search every terminology the service offers
    #[serde(default)]
    pub all_terminologies: bool,

    #[serde(default = "default_ts_url")]
    pub base_url: String,

    /// Per-request timeout
    #[serde(default = "default_ts_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Results requested per source
    #[serde(default = "default_rows")]
    pub rows: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            explicit_terminologies: Vec::new(),
            collection: None,
            all_terminologies: false,
            base_url: default_ts_url(),
            timeout_seconds: default_ts_timeout(),
            retry_policy: RetryPolicy::default(),
            rows: default_rows(),
        }
    }
}

impl SourceSettings {
    /// Configured sources in declaration order: explicit terminologies, then
    /// the collection, then the all-terminologies search. A terminology
    /// listed twice keeps its first entry.
    pub fn source_specs(&self) -> Vec<SourceSpec> {
        let mut seen = HashSet::new();
        let mut specs: Vec<SourceSpec> = self
            .explicit_terminologies
            .iter()
            .map(|entry| match entry {
                TerminologyEntry::Name(id) => SourceSpec::ontology(id.trim(), ResponseShape::Search),
                TerminologyEntry::Detailed { id, shape } => SourceSpec::ontology(id.trim(), *shape),
            })
            .filter(|spec| seen.insert(spec.id.clone()))
            .collect();

        if let Some(collection) = &self.collection {
            specs.push(SourceSpec::collection(collection.trim()));
        }
        if self.all_terminologies {
            specs.push(SourceSpec::all());
        }
        specs
    }

    /// First source id used by more than one configured source
    fn colliding_id(&self) -> Option<SourceId> {
        let mut seen = HashSet::new();
        self.source_specs()
            .into_iter()
            .map(|spec| spec.id)
            .find(|id| !seen.insert(id.clone()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Extraction backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Built-in stopword chunker
    Local,
    /// Ollama server
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    /// Backends run for every field, results unioned in this order
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendKind>,

    #[serde(default)]
    pub ollama: OllamaConfig,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            ollama: OllamaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Load at startup and save at checkpoints/shutdown
    #[serde(default = "default_true")]
    pub persist: bool,

    #[serde(default = "default_staleness_days")]
    pub staleness_days: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            persist: true,
            staleness_days: default_staleness_days(),
        }
    }
}

impl CacheSettings {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_days.saturating_mul(24 * 60 * 60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_address")]
    pub address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_min_phrase_length() -> usize {
    2
}
fn default_language() -> String {
    "en".to_string()
}
fn default_ts_url() -> String {
    DEFAULT_TS_URL.to_string()
}
fn default_ts_timeout() -> u64 {
    10
}
fn default_rows() -> u32 {
    20
}
fn default_backends() -> Vec<BackendKind> {
    vec![BackendKind::Local]
}
fn default_staleness_days() -> u64 {
    7
}
fn default_address() -> String {
    "127.0.0.1:9000".to_string()
}

impl Settings {
    /// Parse settings from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse configuration")
    }

    /// Effective worker pool size
    pub fn max_threads(&self) -> usize {
        self.max_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    /// Compiled ignore patterns
    pub fn ignore_patterns(&self) -> Result<Vec<Pattern>, ConfigError> {
        self.annotation
            .ignore_fields
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| ConfigError::InvalidIgnorePattern {
                    pattern: p.clone(),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    /// Checks shared by every mode
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ts_sources.source_specs().is_empty() {
            return Err(ConfigError::NoTerminologySource);
        }
        if let Some(id) = self.ts_sources.colliding_id() {
            return Err(ConfigError::DuplicateSourceId(id.to_string()));
        }
        if self.extraction.backends.is_empty() {
            return Err(ConfigError::NoExtractionBackend);
        }
        if self.max_threads == Some(0) {
            return Err(ConfigError::ZeroThreads);
        }
        if !(0.0..=1.0).contains(&self.annotation.min_score) {
            return Err(ConfigError::InvalidMinScore(self.annotation.min_score));
        }
        self.ignore_patterns()?;
        Ok(())
    }

    /// Batch runs additionally need at least one relevant field
    pub fn validate_batch(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.annotation.relevant_fields.values().all(Vec::is_empty) {
            return Err(ConfigError::NoRelevantField);
        }
        Ok(())
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory (cache, statistics)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub settings: Settings,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`, without a config file
    pub fn with_home(home: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            home: home.into(),
            config_file: None,
            settings,
        }
    }

    /// Persisted lookup cache ($TERMTAGGER_HOME/cache.json)
    pub fn cache_path(&self) -> PathBuf {
        self.home.join("cache.json")
    }

    /// Persisted statistics ($TERMTAGGER_HOME/statistics.json)
    pub fn statistics_path(&self) -> PathBuf {
        self.home.join("statistics.json")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path).canonicalize().unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources.
///
/// `explicit` wins over discovery; a missing explicit file is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };

    let mut settings = match &config_file {
        Some(path) => load_config_file(path)?,
        None => Settings::default(),
    };

    let home = if let Ok(env_home) = std::env::var("TERMTAGGER_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (&settings.home, &config_file) {
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    if let Ok(url) = std::env::var("TERMTAGGER_TS_URL") {
        settings.ts_sources.base_url = url;
    }

    Ok(ResolvedConfig {
        home,
        config_file,
        settings,
    })
}
