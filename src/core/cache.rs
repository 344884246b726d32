//! Lookup cache with single-flight computation per key.
//!
//! Entries are immutable and replaced on refresh. A missing or stale key is
//! computed by exactly one caller; concurrent callers for the same key await
//! the same shared future and receive the same result or the same error.
//!
//! The state lock is held only for map operations, never across an await,
//! so unrelated keys are not serialized behind a slow lookup.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::core::terminology::SearchError;
use crate::domain::{CandidateMatch, LookupKey, LookupOrigin, SearchResult, SourceFailure};

/// Default staleness window: one week
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A cached result set. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: LookupKey,
    pub matches: Arc<Vec<CandidateMatch>>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: LookupKey, matches: Arc<Vec<CandidateMatch>>) -> Self {
        Self::with_created_at(key, matches, Utc::now())
    }

    pub fn with_created_at(key: LookupKey, matches: Arc<Vec<CandidateMatch>>, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            matches,
            created_at,
        }
    }

    /// True while the entry's age is within the window
    pub fn is_fresh(&self, window: Duration) -> bool {
        match (Utc::now() - self.created_at).to_std() {
            Ok(age) => age <= window,
            // Timestamp in the future (clock skew)
            Err(_) => true,
        }
    }
}

/// Result of one computation, as shared with every waiter
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub matches: Arc<Vec<CandidateMatch>>,

    /// Sources that failed; a non-empty list keeps the result out of the cache
    pub failures: Arc<Vec<SourceFailure>>,
}

impl Resolved {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

impl From<SearchResult> for Resolved {
    fn from(result: SearchResult) -> Self {
        Self {
            matches: Arc::new(result.matches),
            failures: Arc::new(result.failures),
        }
    }
}

/// The computing caller failed; every waiter receives a clone of this
#[derive(Debug, Clone, Error)]
pub enum CacheComputeError {
    #[error("all {} terminology sources failed", .0.len())]
    AllSourcesFailed(Arc<Vec<SourceFailure>>),

    #[error("lookup computation panicked")]
    Panicked,

    #[error("lookup failed: {0}")]
    Failed(String),
}

impl From<SearchError> for CacheComputeError {
    fn from(error: SearchError) -> Self {
        match error {
            SearchError::AllSourcesFailed(failures) => Self::AllSourcesFailed(Arc::new(failures)),
            other => Self::Failed(other.to_string()),
        }
    }
}

/// A served lookup and how it was served
#[derive(Debug, Clone)]
pub struct Lookup {
    pub resolved: Resolved,
    pub origin: LookupOrigin,
}

/// A failed lookup and whether this caller ran the computation
#[derive(Debug, Clone)]
pub struct LookupFailure {
    pub error: CacheComputeError,
    pub origin: LookupOrigin,
}

type Computation = Shared<BoxFuture<'static, Result<Resolved, CacheComputeError>>>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<LookupKey, Arc<CacheEntry>>,
    inflight: HashMap<LookupKey, Computation>,
}

/// On-disk snapshot layout
#[derive(Serialize, Deserialize)]
struct CacheFile {
    saved_at: DateTime<Utc>,
    entries: Vec<CacheEntry>,
}

/// Process-wide lookup cache, cheap to clone and share between workers
#[derive(Clone)]
pub struct LookupCache {
    state: Arc<Mutex<CacheState>>,
    window: Duration,
    enabled: bool,
}

impl LookupCache {
    /// Empty cache. A disabled cache still deduplicates in-flight lookups
    /// but keeps nothing afterwards.
    pub fn new(window: Duration, enabled: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            window,
            enabled,
        }
    }

    /// Cache pre-populated with entries (stale ones are dropped)
    pub fn from_entries(entries: impl IntoIterator<Item = CacheEntry>, window: Duration, enabled: bool) -> Self {
        let cache = Self::new(window, enabled);
        {
            let mut state = cache.lock();
            for entry in entries.into_iter().filter(|e| e.is_fresh(window)) {
                state.entries.insert(entry.key.clone(), Arc::new(entry));
            }
        }
        cache
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        lock_state(&self.state)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of stored entries (fresh or not yet pruned)
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the stored entries, sorted by key text
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.lock().entries.values().map(|e| (**e).clone()).collect();
        entries.sort_by_key(|e| e.key.to_string());
        entries
    }

    /// Return the fresh entry for `key`, or run `compute` once for all
    /// concurrent callers of the same key.
    ///
    /// A complete result is stored; a partial one (some sources failed) is
    /// returned but not stored, and neither is an error.
    pub async fn get_or_compute<F, Fut>(&self, key: &LookupKey, compute: F) -> Result<Lookup, LookupFailure>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Resolved, CacheComputeError>> + Send + 'static,
    {
        let (computation, origin) = {
            let mut state = self.lock();

            if let Some(entry) = state.entries.get(key) {
                if entry.is_fresh(self.window) {
                    return Ok(Lookup {
                        resolved: Resolved {
                            matches: Arc::clone(&entry.matches),
                            failures: Arc::default(),
                        },
                        origin: LookupOrigin::Hit,
                    });
                }
                debug!(key = %key, "Cache entry stale, refreshing");
                state.entries.remove(key);
            }

            match state.inflight.get(key) {
                Some(running) => (running.clone(), LookupOrigin::Joined),
                None => {
                    let computation = self.computation(key.clone(), compute);
                    state.inflight.insert(key.clone(), computation.clone());
                    (computation, LookupOrigin::Computed)
                }
            }
        };

        match computation.await {
            Ok(resolved) => Ok(Lookup { resolved, origin }),
            Err(error) => Err(LookupFailure { error, origin }),
        }
    }

    /// Wrap `compute` so that completion clears the in-flight handle and
    /// stores a complete result under the same lock acquisition.
    fn computation<F, Fut>(&self, key: LookupKey, compute: F) -> Computation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Resolved, CacheComputeError>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let store = self.enabled;

        async move {
            let result = AssertUnwindSafe(async move { compute().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(CacheComputeError::Panicked));

            {
                let mut state = lock_state(&state);
                state.inflight.remove(&key);
                if let Ok(resolved) = &result {
                    if store && resolved.is_complete() {
                        let entry = CacheEntry::new(key.clone(), Arc::clone(&resolved.matches));
                        state.entries.insert(key, Arc::new(entry));
                    }
                }
            }

            result
        }
        .boxed()
        .shared()
    }

    /// Drop stale entries, returning how many were removed
    pub fn prune(&self) -> usize {
        let window = self.window;
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_fresh(window));
        before - state.entries.len()
    }

    /// Load a persisted cache. A missing file yields an empty cache, an
    /// unreadable one is logged and ignored; stale entries are dropped.
    pub async fn load(path: &Path, window: Duration, enabled: bool) -> Result<Self> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::new(window, enabled)),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read cache file: {}", path.display()));
            }
        };

        let file: CacheFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable cache file");
                return Ok(Self::new(window, enabled));
            }
        };

        let total = file.entries.len();
        let cache = Self::from_entries(file.entries, window, enabled);
        info!(
            path = %path.display(),
            loaded = cache.len(),
            dropped = total - cache.len(),
            "Loaded lookup cache"
        );
        Ok(cache)
    }

    /// Persist fresh entries as JSON
    pub async fn save(&self, path: &Path) -> Result<usize> {
        let entries: Vec<CacheEntry> = self.entries().into_iter().filter(|e| e.is_fresh(self.window)).collect();
        let count = entries.len();

        let file = CacheFile {
            saved_at: Utc::now(),
            entries,
        };
        let json = serde_json::to_string_pretty(&file).context("Failed to serialize cache")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
        }
        fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write cache file: {}", path.display()))?;

        info!(path = %path.display(), entries = count, "Saved lookup cache");
        Ok(count)
    }
}

fn lock_state(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
