//! End-to-end runs through the public API with an in-process backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use subline::config::{CacheConfig, PunctuationStyle};
use subline::job::{JobWarning, ResultSource};
use subline::translate::cache::Fingerprint;
use subline::{
    BatchDispatcher, FingerprintCache, Job, PipelineConfig, TranslateError, TranslateRequest,
    TranslationParams, Translator,
};

/// Returns a canned translation per source line and counts calls.
struct PhraseBook {
    calls: AtomicUsize,
}

impl PhraseBook {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Translator for PhraseBook {
    async fn translate(&self, request: &TranslateRequest) -> Result<String, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let text = match request.text.as_str() {
            "Hello" => "你好",
            "Goodbye" => "再見",
            "Wait, what?" => "等等, 什麼?",
            "Long" => "這是一個非常非常長的句子，它一定會超過每行十六個字的限制，所以需要換行處理。",
            other => return Ok(format!("[{other}]")),
        };
        Ok(text.to_string())
    }

    fn name(&self) -> &str {
        "phrase-book"
    }
}

fn config_with_db(path: &std::path::Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.cache = CacheConfig {
        db_path: Some(path.to_path_buf()),
        ..CacheConfig::default()
    };
    config
}

fn params() -> TranslationParams {
    TranslationParams::new("en", "zh-TW", "test-model")
}

#[tokio::test]
async fn persistent_cache_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_with_db(&dir.path().join("cache.db"));
    let lines = ["Hello", "Goodbye", "Hello", "Something else"];

    let first_backend = PhraseBook::new();
    let first = BatchDispatcher::new(
        Arc::clone(&first_backend),
        Arc::new(FingerprintCache::open(&config.cache)),
        &config,
    )
    .unwrap();
    let report = first.run(Job::from_lines(&lines, 0), &params()).await.unwrap();
    assert!(report.is_complete());
    assert!(report.warnings.is_empty());
    assert_eq!(first_backend.calls(), 3);
    drop(first);

    let second_backend = PhraseBook::new();
    let cache = Arc::new(FingerprintCache::open(&config.cache));
    assert!(cache.is_persistent_available());
    assert_eq!(cache.memory_len(), 0);
    let second =
        BatchDispatcher::new(Arc::clone(&second_backend), Arc::clone(&cache), &config).unwrap();
    let again = second.run(Job::from_lines(&lines, 0), &params()).await.unwrap();

    assert_eq!(second_backend.calls(), 0);
    assert_eq!(again.texts(), report.texts());
    assert!(again
        .results
        .iter()
        .all(|r| r.outcome.as_ref().unwrap().source == ResultSource::Cache));

    let hello = Fingerprint::compute("Hello", &[], &params().model_identifier());
    assert!(cache.entry(&hello).unwrap().hit_count >= 3);
}

#[tokio::test]
async fn other_target_language_misses_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_with_db(&dir.path().join("cache.db"));
    let backend = PhraseBook::new();
    let dispatcher = BatchDispatcher::new(
        Arc::clone(&backend),
        Arc::new(FingerprintCache::open(&config.cache)),
        &config,
    )
    .unwrap();

    dispatcher
        .run(Job::from_lines(&["Hello"], 0), &params())
        .await
        .unwrap();
    dispatcher
        .run(
            Job::from_lines(&["Hello"], 0),
            &TranslationParams::new("en", "ja", "test-model"),
        )
        .await
        .unwrap();
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn output_is_ordered_and_formatted() {
    let mut config = PipelineConfig::default();
    config.cache.db_path = None;
    let backend = PhraseBook::new();
    let dispatcher = BatchDispatcher::new(
        Arc::clone(&backend),
        Arc::new(FingerprintCache::memory_only(&config.cache)),
        &config,
    )
    .unwrap();
    let lines = ["Hello", "Wait, what?", "Long", "", "Goodbye"];
    let report = dispatcher
        .run(Job::from_lines(&lines, 1), &params())
        .await
        .unwrap();

    assert_eq!(report.results.len(), 5);
    assert_eq!(report.results[0].text(), Some("你好"));
    assert_eq!(report.results[1].text(), Some("等等，什麼？"));
    assert_eq!(report.results[3].text(), Some(""));
    assert_eq!(report.results[4].text(), Some("再見"));

    let long = report.results[2].outcome.as_ref().unwrap();
    assert!(long.lines.len() <= 2);
    assert!(long.lines.iter().all(|l| l.chars().count() <= 16));
    assert!(!long.format_warnings.is_empty());

    assert_eq!(report.stats.total, 5);
    assert_eq!(report.stats.blank, 1);
    assert_eq!(report.stats.translated, 4);
    assert!(report.metrics.contains_key("backend_call"));
}

#[tokio::test]
async fn preserve_style_leaves_punctuation() {
    let mut config = PipelineConfig::default();
    config.cache.db_path = None;
    config.format.punctuation = PunctuationStyle::Preserve;
    let dispatcher = BatchDispatcher::new(
        PhraseBook::new(),
        Arc::new(FingerprintCache::memory_only(&config.cache)),
        &config,
    )
    .unwrap();
    let report = dispatcher
        .run(Job::from_lines(&["Wait, what?"], 0), &params())
        .await
        .unwrap();
    assert_eq!(report.results[0].text(), Some("等等, 什麼?"));
}

#[tokio::test]
async fn unopenable_store_degrades_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the database file should be.
    let config = config_with_db(dir.path());
    let cache = Arc::new(FingerprintCache::open(&config.cache));
    let dispatcher = BatchDispatcher::new(PhraseBook::new(), cache, &config).unwrap();
    let report = dispatcher
        .run(Job::from_lines(&["Hello"], 0), &params())
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.warnings, vec![JobWarning::CacheDegraded]);
}
