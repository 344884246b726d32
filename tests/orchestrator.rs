//! Orchestrator Integration Tests
//!
//! Tests for bounded concurrent runs: ordering, iteration limits, shared
//! lookups, failure isolation and stop handling.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{annotator, engine, local, Behavior, FailingBackend, FakeSource, FixedBackend, PanickingBackend};
use glob::Pattern;
use termtagger::adapters::{ExtractionBackend, LocalChunker, TerminologySource};
use termtagger::core::{
    parse_markers, strip_markers, AnnotationPolicy, Annotator, EngineSettings, FieldLanguages, LookupCache,
    Orchestrator, PhraseExtractor, DEFAULT_STALENESS,
};
use termtagger::domain::{FieldSkip, LanguageTag, OutcomeStatus, Record, SkippedField, SourceError};

const CO2_IRI: &str = "http://purl.obolibrary.org/obo/CHEBI_16526";

fn chebi() -> Arc<FakeSource> {
    Arc::new(FakeSource::answering(
        "chebi",
        &[
            ("carbon dioxide", &[("carbon dioxide", CO2_IRI)]),
            ("metal oxide", &[("metal oxide", "http://purl.obolibrary.org/obo/CHEBI_50860")]),
        ],
    ))
}

fn records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| Record::from_pairs([("id", i.to_string()), ("text", "Samples were stored in carbon dioxide".to_string())]))
        .collect()
}

#[tokio::test]
async fn test_max_iterations_limits_processed_records() {
    let source = chebi();
    let annotator = Annotator::new(
        Arc::new(PhraseExtractor::new(local(), 2)),
        Arc::new(common::client(vec![source as Arc<dyn TerminologySource>])),
        LookupCache::new(DEFAULT_STALENESS, true),
        AnnotationPolicy::default(),
    );
    let orchestrator = Orchestrator::new(
        annotator,
        EngineSettings {
            max_threads: 4,
            max_iterations: Some(3),
            field_languages: FieldLanguages::single("text", LanguageTag::english()),
            ..EngineSettings::default()
        },
    );

    let outcomes = orchestrator.run(records(10)).await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(orchestrator.statistics().records_total, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_outcomes_follow_input_order() {
    let orchestrator = engine(vec![chebi()], local(), 4);
    let input = records(12);

    let outcomes = orchestrator.run(input.clone()).await;

    assert_eq!(outcomes.len(), 12);
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.index, i);
        assert_eq!(outcome.original, input[i]);
        assert_eq!(outcome.status, OutcomeStatus::Success);
        // Unannotated fields pass through untouched
        assert_eq!(outcome.annotated.get("id"), input[i].get("id"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_phrase_is_looked_up_once() {
    let source = Arc::new(
        FakeSource::answering("chebi", &[("carbon dioxide", &[("carbon dioxide", CO2_IRI)])])
            .with_delay(Duration::from_millis(50)),
    );
    let orchestrator = engine(vec![source.clone()], local(), 8);

    let outcomes = orchestrator.run(records(8)).await;

    assert_eq!(source.calls_for("carbon dioxide"), 1);
    assert!(outcomes.iter().all(|o| o.status == OutcomeStatus::Success));

    let stats = orchestrator.statistics();
    // Three phrases per record: Samples, stored, carbon dioxide
    assert_eq!(stats.phrases_total, 24);
    assert_eq!(stats.cache_hits + stats.cache_misses, 24);
    assert_eq!(stats.cache_misses, source.calls() as u64);
    assert_eq!(stats.matched, 8);
}

#[tokio::test]
async fn test_annotated_text_carries_match_marker() {
    let orchestrator = engine(vec![chebi()], local(), 2);
    let record = Record::from_pairs([("text", "Samples of metal oxide were stored in carbon dioxide.")]);

    let outcomes = orchestrator.run(vec![record.clone()]).await;
    let annotated = outcomes[0].annotated.get("text").unwrap();

    assert_eq!(strip_markers(annotated), record.get("text").unwrap());
    assert!(annotated.contains(r#"carbon dioxide {"@match":"#));

    let markers: Vec<_> = parse_markers(annotated).into_iter().map(Result::unwrap).collect();
    assert_eq!(markers.len(), 2);
    assert_eq!(markers[0].phrase, "metal oxide");
    assert_eq!(markers[1].iri, CO2_IRI);
    assert!(outcomes[0].validation.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_record_does_not_stop_batch() {
    let backends: Vec<Arc<dyn ExtractionBackend>> = vec![Arc::new(PanickingBackend::new("explode"))];
    let orchestrator = engine(vec![chebi()], backends, 2);

    let mut input = records(5);
    input[2] = Record::from_pairs([("text", "this will explode")]);

    let outcomes = orchestrator.run(input.clone()).await;

    assert_eq!(outcomes.len(), 5);
    assert_eq!(outcomes[2].status, OutcomeStatus::Failure);
    assert!(outcomes[2].error.is_some());
    assert_eq!(outcomes[2].annotated, input[2]);
    for i in [0, 1, 3, 4] {
        assert_eq!(outcomes[i].status, OutcomeStatus::Success);
    }
    assert_eq!(orchestrator.statistics().records_failed, 1);
}

#[tokio::test]
async fn test_stop_before_run_processes_nothing() {
    let orchestrator = engine(vec![chebi()], local(), 2);
    orchestrator.stop_signal().stop();

    let outcomes = orchestrator.run(records(5)).await;

    assert!(outcomes.is_empty());
    assert_eq!(orchestrator.statistics().validation_failures, 0);
}

#[tokio::test]
async fn test_stop_mid_run_finishes_started_records() {
    const WORDS: [&str; 10] = [
        "argon", "boron", "carbon", "cobalt", "copper", "helium", "iodine", "nickel", "oxygen", "sodium",
    ];
    let source = Arc::new(FakeSource::answering("chebi", &[]).with_delay(Duration::from_millis(100)));
    let orchestrator = engine(vec![source], local(), 2);

    let input: Vec<Record> = WORDS
        .iter()
        .map(|w| Record::from_pairs([("text", format!("Measured {}", w))]))
        .collect();

    let stop = orchestrator.stop_signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop.stop();
    });

    let outcomes = orchestrator.run(input).await;

    assert!(!outcomes.is_empty());
    assert!(outcomes.len() < WORDS.len());
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.index, i);
        assert_ne!(outcome.status, OutcomeStatus::Failure);
    }
}

#[tokio::test]
async fn test_failing_source_gives_partial_failure_and_is_not_cached() {
    let down = Arc::new(FakeSource::new("down", Behavior::Fail(SourceError::Status { status: 404 })));
    let orchestrator = engine(vec![chebi(), down.clone()], local(), 1);

    let first = orchestrator.run(records(1)).await;
    assert_eq!(first[0].status, OutcomeStatus::PartialFailure);
    assert!(first[0].matched().any(|r| r.phrase.normalized == "carbon dioxide"));

    // Incomplete results stay out of the cache
    orchestrator.run(records(1)).await;
    assert_eq!(down.calls_for("carbon dioxide"), 2);
    assert!(orchestrator.cache().is_empty());
    assert_eq!(orchestrator.statistics().source_errors.get("down"), Some(&6));
}

#[tokio::test]
async fn test_all_backends_failing_fails_record() {
    let backends: Vec<Arc<dyn ExtractionBackend>> = vec![Arc::new(FailingBackend)];
    let orchestrator = engine(vec![chebi()], backends, 1);

    let outcomes = orchestrator.run(records(1)).await;

    assert_eq!(outcomes[0].status, OutcomeStatus::Failure);
    assert!(matches!(
        outcomes[0].skipped_fields[0].skip,
        FieldSkip::ExtractionFailed { .. }
    ));
    assert_eq!(outcomes[0].annotated, outcomes[0].original);
}

#[tokio::test]
async fn test_one_failing_backend_is_tolerated() {
    let backends: Vec<Arc<dyn ExtractionBackend>> = vec![Arc::new(FailingBackend), Arc::new(LocalChunker::new())];
    let orchestrator = engine(vec![chebi()], backends, 1);

    let outcomes = orchestrator.run(records(1)).await;

    assert_eq!(outcomes[0].status, OutcomeStatus::Success);
    assert_eq!(outcomes[0].matched().count(), 1);
    assert_eq!(outcomes[0].backend_errors, vec!["failing"]);
    assert_eq!(orchestrator.statistics().extraction_errors.get("failing"), Some(&1));
}

#[tokio::test]
async fn test_interactive_text_annotation() {
    let orchestrator = engine(vec![chebi()], local(), 1);

    let outcome = orchestrator
        .annotate_text("Stored in Carbon Dioxide", LanguageTag::english())
        .await;

    assert_eq!(outcome.status, OutcomeStatus::Success);
    let text = outcome.annotated.get("text").unwrap();
    assert!(text.starts_with(r#"Stored in Carbon Dioxide {"@match":"#));
    assert_eq!(orchestrator.statistics().records_total, 1);
}

#[tokio::test]
async fn test_shutdown_persists_cache_and_statistics() {
    let temp = tempfile::TempDir::new().unwrap();
    let cache_path = temp.path().join("cache.json");
    let statistics_path = temp.path().join("statistics.json");

    let annotator = Annotator::new(
        Arc::new(PhraseExtractor::new(local(), 2)),
        Arc::new(common::client(vec![chebi() as Arc<dyn TerminologySource>])),
        LookupCache::new(DEFAULT_STALENESS, true),
        AnnotationPolicy::default(),
    );
    let orchestrator = Orchestrator::new(
        annotator,
        EngineSettings {
            max_threads: 2,
            field_languages: FieldLanguages::single("text", LanguageTag::english()),
            cache_path: Some(cache_path.clone()),
            statistics_path: Some(statistics_path.clone()),
            ..EngineSettings::default()
        },
    );

    orchestrator.run(records(2)).await;
    orchestrator.shutdown().await.unwrap();

    let cache = LookupCache::load(&cache_path, DEFAULT_STALENESS, true).await.unwrap();
    assert_eq!(cache.len(), orchestrator.cache().len());
    assert!(statistics_path.exists());
}

#[tokio::test]
async fn test_every_chosen_match_is_marked() {
    let source = Arc::new(FakeSource::answering(
        "chebi",
        &[
            ("metal samples", &[("metal samples", "http://example.org/MS")]),
            ("metal", &[("metal", "http://example.org/M")]),
        ],
    ));
    let backends: Vec<Arc<dyn ExtractionBackend>> = vec![Arc::new(FixedBackend(vec!["Metal samples", "metal"]))];
    let orchestrator = engine(vec![source], backends, 1);

    let outcomes = orchestrator
        .run(vec![Record::from_pairs([("text", "Metal samples and metal")])])
        .await;
    let outcome = &outcomes[0];
    let annotated = outcome.annotated.get("text").unwrap();

    let markers: Vec<_> = parse_markers(annotated).into_iter().map(Result::unwrap).collect();
    assert_eq!(markers.len(), outcome.matched().count());
    assert_eq!(markers[0].iri, "http://example.org/MS");
    assert_eq!(markers[1].iri, "http://example.org/M");
    assert!(annotated.ends_with(r#"and metal {"@match":{"phrase":"metal","source":"chebi","id":"M","iri":"http://example.org/M","label":"metal","score":1.0}}"#));
    assert!(outcome.validation.is_empty());

    let stats = orchestrator.statistics();
    assert_eq!(stats.matched, 2);
    assert_eq!(stats.unplaced, 0);
}

#[tokio::test]
async fn test_covered_match_is_reported_unplaced() {
    let source = Arc::new(FakeSource::answering(
        "chebi",
        &[
            ("metal oxide", &[("metal oxide", "http://example.org/MO")]),
            ("metal", &[("metal", "http://example.org/M")]),
        ],
    ));
    let backends: Vec<Arc<dyn ExtractionBackend>> = vec![Arc::new(FixedBackend(vec!["metal oxide", "metal"]))];
    let orchestrator = engine(vec![source], backends, 1);

    let outcomes = orchestrator
        .run(vec![Record::from_pairs([("text", "Some metal oxide")])])
        .await;

    assert_eq!(parse_markers(outcomes[0].annotated.get("text").unwrap()).len(), 1);
    assert_eq!(outcomes[0].validation.len(), 1);

    let stats = orchestrator.statistics();
    assert_eq!(stats.matched, 1);
    assert_eq!(stats.unplaced, 1);
    assert_eq!(stats.validation_failures, 1);
}

#[tokio::test]
async fn test_min_score_rejects_weak_top_match() {
    let source = Arc::new(FakeSource::answering(
        "chebi",
        &[
            ("carbon dioxide", &[("carbon dioxide", CO2_IRI)]),
            ("stored", &[("storage facility", "http://example.org/storage")]),
        ],
    ));
    let policy = AnnotationPolicy {
        min_score: 0.9,
        ..AnnotationPolicy::default()
    };
    let orchestrator = Orchestrator::new(
        annotator(vec![source], local(), policy),
        EngineSettings {
            max_threads: 1,
            field_languages: FieldLanguages::single("text", LanguageTag::english()),
            ..EngineSettings::default()
        },
    );

    let outcomes = orchestrator.run(records(1)).await;
    let outcome = &outcomes[0];

    let stored = outcome
        .resolutions
        .iter()
        .find(|r| r.phrase.normalized == "stored")
        .unwrap();
    assert!(stored.chosen.is_none());
    assert_eq!(stored.candidates.len(), 1);

    let matched: Vec<&str> = outcome.matched().map(|r| r.phrase.normalized.as_str()).collect();
    assert_eq!(matched, vec!["carbon dioxide"]);
    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(parse_markers(outcome.annotated.get("text").unwrap()).len(), 1);
    assert!(orchestrator.statistics().missed_phrases.contains("stored"));
}

#[tokio::test]
async fn test_ignored_fields_and_values_are_left_untouched() {
    let source = chebi();
    let policy = AnnotationPolicy {
        ignore_fields: vec![Pattern::new("*_id").unwrap()],
        ignore_values: ["n/a".to_string()].into_iter().collect(),
        ..AnnotationPolicy::default()
    };
    let mut fields = BTreeMap::new();
    fields.insert(
        "en".to_string(),
        vec!["text".to_string(), "sample_id".to_string(), "notes".to_string()],
    );
    let orchestrator = Orchestrator::new(
        annotator(vec![source.clone()], local(), policy),
        EngineSettings {
            max_threads: 1,
            field_languages: FieldLanguages::from_map(&fields),
            ..EngineSettings::default()
        },
    );

    let record = Record::from_pairs([
        ("text", "Samples were stored in carbon dioxide"),
        ("sample_id", "metal oxide"),
        ("notes", " n/a "),
    ]);
    let outcomes = orchestrator.run(vec![record.clone()]).await;
    let outcome = &outcomes[0];

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(
        outcome.skipped_fields,
        vec![
            SkippedField {
                field: "sample_id".into(),
                skip: FieldSkip::IgnoredField
            },
            SkippedField {
                field: "notes".into(),
                skip: FieldSkip::IgnoredValue
            },
        ]
    );
    assert_eq!(outcome.annotated.get("sample_id"), record.get("sample_id"));
    assert_eq!(outcome.annotated.get("notes"), record.get("notes"));
    assert!(outcome.resolutions.iter().all(|r| r.phrase.field == "text"));
    assert_eq!(source.calls_for("metal oxide"), 0);
    assert_eq!(outcome.matched().count(), 1);
}

#[tokio::test]
async fn test_checkpoint_saves_cache_during_run() {
    let temp = tempfile::TempDir::new().unwrap();
    let cache_path = temp.path().join("cache.json");

    let orchestrator = Orchestrator::new(
        annotator(vec![chebi()], local(), AnnotationPolicy::default()),
        EngineSettings {
            max_threads: 1,
            field_languages: FieldLanguages::single("text", LanguageTag::english()),
            cache_path: Some(cache_path.clone()),
            checkpoint_every: Some(2),
            ..EngineSettings::default()
        },
    );

    orchestrator.run(records(2)).await;

    // Saved by the checkpoint, no shutdown involved
    let saved = LookupCache::load(&cache_path, DEFAULT_STALENESS, true).await.unwrap();
    assert!(!saved.is_empty());
    assert_eq!(saved.len(), orchestrator.cache().len());
}

#[tokio::test]
async fn test_no_checkpoint_before_interval() {
    let temp = tempfile::TempDir::new().unwrap();
    let cache_path = temp.path().join("cache.json");

    let orchestrator = Orchestrator::new(
        annotator(vec![chebi()], local(), AnnotationPolicy::default()),
        EngineSettings {
            max_threads: 1,
            field_languages: FieldLanguages::single("text", LanguageTag::english()),
            cache_path: Some(cache_path.clone()),
            checkpoint_every: Some(5),
            ..EngineSettings::default()
        },
    );

    orchestrator.run(records(3)).await;
    assert!(!cache_path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joined_failures_are_neither_hits_nor_misses() {
    let down = Arc::new(
        FakeSource::new("down", Behavior::Fail(SourceError::Status { status: 404 })).with_delay(Duration::from_millis(100)),
    );
    let orchestrator = engine(vec![down.clone()], local(), 2);

    let outcomes = orchestrator.run(records(2)).await;

    assert!(outcomes.iter().all(|o| o.status == OutcomeStatus::Failure));
    assert_eq!(down.calls(), 3);

    let stats = orchestrator.statistics();
    assert_eq!(stats.phrases_total, 6);
    assert_eq!(stats.cache_misses, 3);
    assert_eq!(stats.cache_hits, 0);
}

#[tokio::test]
async fn test_interactive_text_in_selected_sources() {
    let chebi = chebi();
    let envo = Arc::new(FakeSource::answering(
        "envo",
        &[("carbon dioxide", &[("carbon dioxide", "http://purl.obolibrary.org/obo/ENVO_1")])],
    ));
    let orchestrator = engine(vec![chebi.clone(), envo.clone()], local(), 1);

    let outcome = orchestrator
        .annotate_text_in(
            "Stored in carbon dioxide",
            LanguageTag::english(),
            vec![termtagger::domain::SourceId::from("envo")],
        )
        .await;

    assert_eq!(chebi.calls(), 0);
    let chosen: Vec<&str> = outcome
        .matched()
        .filter_map(|r| r.chosen.as_ref())
        .map(|m| m.source.as_str())
        .collect();
    assert_eq!(chosen, vec!["envo"]);

    // Selections are cached apart from the configured set
    orchestrator
        .annotate_text("Stored in carbon dioxide", LanguageTag::english())
        .await;
    assert_eq!(chebi.calls_for("carbon dioxide"), 1);
}
