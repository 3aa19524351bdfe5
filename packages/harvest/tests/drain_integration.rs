//! Integration tests for enqueue-and-drain against both store backends.
//!
//! Every scenario runs twice: once on MemoryStore and once on an in-memory
//! SQLite database.

use std::sync::Arc;
use std::time::Duration;

use harvest::testing::{RecordingObserver, ScriptedExtractor};
use harvest::{
    enqueue_and_drain, EngineConfig, ExtractionEngine, MemoryStore, NoopObserver, SqliteStore,
    WorkInput, WorkStatus, WorkStore,
};

/// Both backends, labelled for assertion messages.
async fn stores() -> Vec<(&'static str, Arc<dyn WorkStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new()) as Arc<dyn WorkStore>),
        ("sqlite", Arc::new(SqliteStore::in_memory().await.unwrap())),
    ]
}

fn urls(keys: &[&str]) -> Vec<WorkInput> {
    keys.iter().map(WorkInput::url).collect()
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_concurrency(3)
        .with_max_attempts(3)
        .with_backoff_base(Duration::from_millis(10))
}

#[tokio::test]
async fn test_enqueue_is_idempotent_by_key() {
    for (name, store) in stores().await {
        assert_eq!(store.enqueue(&urls(&["a", "b"])).await.unwrap(), 2, "{name}");
        assert_eq!(store.enqueue(&urls(&["b", "c"])).await.unwrap(), 1, "{name}");

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3, "{name}");
        assert_eq!(stats.pending, 3, "{name}");
    }
}

#[tokio::test]
async fn test_succeeded_items_are_never_extracted_again() {
    for (name, store) in stores().await {
        let extractor = Arc::new(ScriptedExtractor::new());
        let inputs = urls(&["https://a.example", "https://b.example"]);

        let first = enqueue_and_drain(
            Arc::clone(&store),
            &inputs,
            extractor.clone(),
            &fast_config(),
            &NoopObserver,
        )
        .await
        .unwrap();
        assert_eq!(first.succeeded, 2, "{name}");

        // Re-submitting the same inputs is a no-op
        let second = enqueue_and_drain(
            Arc::clone(&store),
            &inputs,
            extractor.clone(),
            &fast_config(),
            &NoopObserver,
        )
        .await
        .unwrap();
        assert_eq!(second.total, 0, "{name}");
        assert_eq!(second.attempts, 0, "{name}");

        assert_eq!(extractor.calls_for("https://a.example"), 1, "{name}");
        assert_eq!(extractor.calls_for("https://b.example"), 1, "{name}");

        for item in store.list(Some(WorkStatus::Success)).await.unwrap() {
            assert_eq!(item.error, None, "{name}");
            assert_eq!(item.result.unwrap()["attempt"], 1, "{name}");
        }
    }
}

#[tokio::test]
async fn test_concurrency_stays_within_bound() {
    for (name, store) in stores().await {
        let extractor = Arc::new(ScriptedExtractor::new().with_delay(Duration::from_millis(30)));
        let inputs = urls(&["k1", "k2", "k3", "k4", "k5", "k6"]);
        let config = fast_config().with_concurrency(2);

        let summary = enqueue_and_drain(store, &inputs, extractor.clone(), &config, &NoopObserver)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 6, "{name}");
        assert_eq!(extractor.max_in_flight(), 2, "{name}");
        assert_eq!(extractor.in_flight(), 0, "{name}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engines_sharing_a_database_extract_each_item_once() {
    let path = std::env::temp_dir().join(format!("harvest-drain-{}.db", uuid::Uuid::now_v7()));
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let first = Arc::new(SqliteStore::connect(&url).await.unwrap());
    let second = Arc::new(SqliteStore::connect(&url).await.unwrap());

    let keys: Vec<String> = (0..30).map(|i| format!("https://site{}.example", i)).collect();
    let inputs: Vec<_> = keys.iter().map(WorkInput::url).collect();
    first.enqueue(&inputs).await.unwrap();

    let extractor = Arc::new(ScriptedExtractor::new().with_delay(Duration::from_millis(5)));
    let config = fast_config().with_concurrency(4);
    let left = ExtractionEngine::new(Arc::clone(&first), config.clone());
    let right = ExtractionEngine::new(Arc::clone(&second), config);

    let (a, b) = tokio::join!(
        left.drain(extractor.clone(), &NoopObserver),
        right.drain(extractor.clone(), &NoopObserver),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.succeeded + b.succeeded, keys.len());
    for key in &keys {
        assert_eq!(extractor.calls_for(key), 1, "{key}");
    }
    assert_eq!(first.stats().await.unwrap().succeeded, keys.len());

    first.pool().close().await;
    second.pool().close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

#[tokio::test]
async fn test_retries_then_gives_up_with_last_error() {
    for (name, store) in stores().await {
        let extractor = Arc::new(
            ScriptedExtractor::new()
                .failing_always("bad", "connection reset")
                .failing_times("flaky", 1, "503 from origin"),
        );
        let inputs = urls(&["good", "bad", "flaky"]);

        let summary = enqueue_and_drain(
            Arc::clone(&store),
            &inputs,
            extractor.clone(),
            &fast_config(),
            &NoopObserver,
        )
        .await
        .unwrap();

        assert_eq!(summary.total, 3, "{name}");
        assert_eq!(summary.succeeded, 2, "{name}");
        assert_eq!(summary.failed, 1, "{name}");
        // bad retried twice, flaky once
        assert_eq!(summary.retried, 3, "{name}");
        assert_eq!(summary.attempts, 6, "{name}");

        assert_eq!(extractor.calls_for("bad"), 3, "{name}");
        assert_eq!(extractor.calls_for("flaky"), 2, "{name}");

        let failed = store.list(Some(WorkStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1, "{name}");
        assert_eq!(failed[0].input.key, "bad", "{name}");
        assert_eq!(failed[0].attempt_count, 3, "{name}");
        assert_eq!(failed[0].error.as_deref(), Some("connection reset"), "{name}");
    }
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    for (name, store) in stores().await {
        let extractor = Arc::new(ScriptedExtractor::new().failing_permanently("ftp://x", "unsupported scheme"));

        let summary = enqueue_and_drain(
            Arc::clone(&store),
            &urls(&["ftp://x"]),
            extractor.clone(),
            &fast_config(),
            &NoopObserver,
        )
        .await
        .unwrap();

        assert_eq!(summary.failed, 1, "{name}");
        assert_eq!(summary.retried, 0, "{name}");
        assert_eq!(extractor.calls_for("ftp://x"), 1, "{name}");
    }
}

#[tokio::test]
async fn test_progress_reaches_completion() {
    for (name, store) in stores().await {
        let extractor = Arc::new(ScriptedExtractor::new().failing_times("b", 1, "timeout"));
        let observer = RecordingObserver::new();

        enqueue_and_drain(store, &urls(&["a", "b", "c"]), extractor, &fast_config(), &observer)
            .await
            .unwrap();

        let progress = observer.progress_updates();
        // One update per attempt, including the retried one
        assert_eq!(progress.len(), 4, "{name}");
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{name}: {progress:?}");
        assert_eq!(progress.last().copied(), Some(1.0), "{name}");
        assert!(observer.statuses().iter().any(|s| s.starts_with("retrying b")), "{name}");
    }
}

#[tokio::test]
async fn test_requeue_failed_gives_a_fresh_budget() {
    for (name, store) in stores().await {
        let failing = Arc::new(ScriptedExtractor::new().failing_always("x", "down"));
        let config = fast_config().with_max_attempts(1);

        let summary = enqueue_and_drain(Arc::clone(&store), &urls(&["x"]), failing, &config, &NoopObserver)
            .await
            .unwrap();
        assert_eq!(summary.failed, 1, "{name}");

        assert_eq!(store.requeue_failed().await.unwrap(), 1, "{name}");

        let healthy = Arc::new(ScriptedExtractor::new());
        let summary = enqueue_and_drain(Arc::clone(&store), &[], healthy.clone(), &config, &NoopObserver)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1, "{name}");
        assert_eq!(healthy.calls(), vec!["x".to_string()], "{name}");

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.succeeded, 1, "{name}");
        assert_eq!(stats.failed, 0, "{name}");
    }
}
