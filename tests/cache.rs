//! Lookup Cache Integration Tests
//!
//! Tests for single-flight computation, staleness and persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use termtagger::core::{CacheComputeError, CacheEntry, LookupCache, Resolved, DEFAULT_STALENESS};
use termtagger::domain::{
    CandidateMatch, LanguageTag, LookupKey, LookupOrigin, SourceError, SourceFailure, SourceId,
};

fn key(phrase: &str) -> LookupKey {
    LookupKey::new(phrase, [SourceId::from("chebi")], LanguageTag::english())
}

fn candidate(label: &str) -> CandidateMatch {
    CandidateMatch {
        source: SourceId::from("chebi"),
        entity_id: format!("http://purl.obolibrary.org/obo/{}", label.replace(' ', "_")),
        short_id: label.replace(' ', "_"),
        labels: vec![label.to_string()],
        entity_types: vec!["class".to_string()],
        ontology: Some("chebi".to_string()),
        score: 1.0,
        obsolete: false,
        defining_ontology: Some(true),
    }
}

fn resolved(label: &str) -> Resolved {
    Resolved {
        matches: Arc::new(vec![candidate(label)]),
        failures: Arc::default(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_computation() {
    let cache = LookupCache::new(DEFAULT_STALENESS, true);
    let computations = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let computations = Arc::clone(&computations);
        handles.push(tokio::spawn(async move {
            cache
                .get_or_compute(&key("carbon dioxide"), move || async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(resolved("carbon dioxide"))
                })
                .await
        }));
    }

    let mut computed = 0;
    for handle in handles {
        let lookup = handle.await.unwrap().unwrap();
        assert_eq!(lookup.resolved.matches[0].primary_label(), "carbon dioxide");
        if lookup.origin == LookupOrigin::Computed {
            computed += 1;
        }
    }

    assert_eq!(computations.load(Ordering::SeqCst), 1);
    assert_eq!(computed, 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_fresh_entry_is_a_hit() {
    let cache = LookupCache::new(DEFAULT_STALENESS, true);

    let first = cache
        .get_or_compute(&key("water"), || async { Ok(resolved("water")) })
        .await
        .unwrap();
    assert_eq!(first.origin, LookupOrigin::Computed);

    let second = cache
        .get_or_compute(&key("Water"), || async { panic!("must not recompute") })
        .await
        .unwrap();
    assert_eq!(second.origin, LookupOrigin::Hit);
    assert_eq!(second.resolved.matches, first.resolved.matches);
}

#[tokio::test]
async fn test_stale_entry_is_recomputed() {
    let stale = CacheEntry::with_created_at(
        key("water"),
        Arc::new(vec![candidate("old water")]),
        Utc::now() - chrono::Duration::days(30),
    );
    let cache = LookupCache::from_entries([stale], DEFAULT_STALENESS, true);

    let lookup = cache
        .get_or_compute(&key("water"), || async { Ok(resolved("water")) })
        .await
        .unwrap();

    assert_eq!(lookup.origin, LookupOrigin::Computed);
    assert_eq!(lookup.resolved.matches[0].primary_label(), "water");
}

#[tokio::test]
async fn test_failure_reaches_every_waiter_and_is_not_cached() {
    let cache = LookupCache::new(DEFAULT_STALENESS, true);

    let failing = |cache: LookupCache| async move {
        cache
            .get_or_compute(&key("unobtainium"), || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err(CacheComputeError::Failed("service down".into()))
            })
            .await
    };

    let (a, b) = tokio::join!(failing(cache.clone()), failing(cache.clone()));
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert!(matches!(a.error, CacheComputeError::Failed(_)));
    assert!(matches!(b.error, CacheComputeError::Failed(_)));
    assert_ne!(a.origin, b.origin);
    assert!(cache.is_empty());

    // Next caller computes again
    let retry = cache
        .get_or_compute(&key("unobtainium"), || async { Ok(resolved("unobtainium")) })
        .await
        .unwrap();
    assert_eq!(retry.origin, LookupOrigin::Computed);
}

#[tokio::test]
async fn test_panicking_computation_fails_waiters() {
    let cache = LookupCache::new(DEFAULT_STALENESS, true);

    let result = cache
        .get_or_compute(&key("boom"), || async { panic!("compute crashed") })
        .await;

    assert!(matches!(result.unwrap_err().error, CacheComputeError::Panicked));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_partial_result_is_returned_but_not_stored() {
    let cache = LookupCache::new(DEFAULT_STALENESS, true);

    let partial = Resolved {
        matches: Arc::new(vec![candidate("water")]),
        failures: Arc::new(vec![SourceFailure {
            source: SourceId::from("envo"),
            error: SourceError::Status { status: 503 },
            attempts: 3,
        }]),
    };

    let lookup = cache
        .get_or_compute(&key("water"), move || async move { Ok(partial) })
        .await
        .unwrap();

    assert!(!lookup.resolved.is_complete());
    assert_eq!(lookup.resolved.matches.len(), 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_disabled_cache_stores_nothing() {
    let cache = LookupCache::new(DEFAULT_STALENESS, false);

    cache
        .get_or_compute(&key("water"), || async { Ok(resolved("water")) })
        .await
        .unwrap();
    assert!(cache.is_empty());

    let again = cache
        .get_or_compute(&key("water"), || async { Ok(resolved("water")) })
        .await
        .unwrap();
    assert_eq!(again.origin, LookupOrigin::Computed);
}

#[tokio::test]
async fn test_persistence_drops_stale_entries() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("cache.json");

    let fresh = CacheEntry::new(key("water"), Arc::new(vec![candidate("water")]));
    let stale = CacheEntry::with_created_at(
        key("ice"),
        Arc::new(vec![candidate("ice")]),
        Utc::now() - chrono::Duration::days(30),
    );

    // Build with a long window so both survive until save
    let cache = LookupCache::from_entries([fresh, stale], Duration::from_secs(365 * 24 * 60 * 60), true);
    assert_eq!(cache.len(), 2);
    cache.save(&path).await.unwrap();

    let loaded = LookupCache::load(&path, DEFAULT_STALENESS, true).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded.entries()[0].key, key("water"));
}

#[tokio::test]
async fn test_missing_or_corrupt_file_gives_empty_cache() {
    let temp = TempDir::new().unwrap();

    let missing = LookupCache::load(&temp.path().join("none.json"), DEFAULT_STALENESS, true)
        .await
        .unwrap();
    assert!(missing.is_empty());

    let corrupt_path = temp.path().join("corrupt.json");
    std::fs::write(&corrupt_path, "{not json").unwrap();
    let corrupt = LookupCache::load(&corrupt_path, DEFAULT_STALENESS, true).await.unwrap();
    assert!(corrupt.is_empty());
}

#[tokio::test]
async fn test_narrower_window_drops_old_entries() {
    let stale = CacheEntry::with_created_at(
        key("ice"),
        Arc::new(vec![candidate("ice")]),
        Utc::now() - chrono::Duration::days(30),
    );
    let fresh = CacheEntry::new(key("water"), Arc::new(vec![candidate("water")]));

    let loaded = LookupCache::from_entries([stale, fresh], Duration::from_secs(365 * 24 * 60 * 60), true);
    assert_eq!(loaded.len(), 2);

    let narrowed = LookupCache::from_entries(loaded.entries(), DEFAULT_STALENESS, true);
    assert_eq!(narrowed.prune(), 0);
    assert_eq!(narrowed.len(), 1);
}
