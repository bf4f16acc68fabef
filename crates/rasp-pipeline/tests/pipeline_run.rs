//! Full-run orchestration tests against in-memory collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rasp_classify::{parse_reply, Classification, ClassifyError, GeminiClient, TopicClassifier};
use rasp_core::{
    BufferSink, Industry, Level, ReviewRecord, ReviewSourceKind, Stage, CATCH_ALL_TOPIC,
};
use rasp_pipeline::{PipelineConfig, PipelineError, ReviewPipeline, RunRequest, RunStatus};
use rasp_sources::{ReviewPage, ReviewSource, SourceError};
use rasp_store::MemoryReviewStore;

struct StaticSource {
    kind: ReviewSourceKind,
    app_id: String,
    pages: Mutex<VecDeque<Result<ReviewPage, SourceError>>>,
}

impl StaticSource {
    fn new(
        kind: ReviewSourceKind,
        app_id: &str,
        pages: Vec<Result<ReviewPage, SourceError>>,
    ) -> Box<dyn ReviewSource> {
        Box::new(Self {
            kind,
            app_id: app_id.to_string(),
            pages: Mutex::new(pages.into()),
        })
    }
}

#[async_trait]
impl ReviewSource for StaticSource {
    fn kind(&self) -> ReviewSourceKind {
        self.kind
    }

    fn app_id(&self) -> &str {
        &self.app_id
    }

    async fn fetch_page(&self, _cursor: Option<&str>) -> Result<ReviewPage, SourceError> {
        self.pages.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(ReviewPage {
                reviews: vec![],
                next: None,
            })
        })
    }
}

/// Classifies every non-empty review as Positive/Customer Support unless the
/// text script says otherwise; counts inference calls.
struct ScriptedClassifier {
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopicClassifier for ScriptedClassifier {
    async fn classify(
        &self,
        text: &str,
        topics: &[&'static str],
    ) -> Result<Classification, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = if text.contains("garbled") {
            "the model rambles with no object".to_string()
        } else {
            r#"{"sentiment":"Positive","topic":"Customer Support"}"#.to_string()
        };
        parse_reply(&reply, topics)
    }
}

fn review(id: &str, text: &str) -> ReviewRecord {
    ReviewRecord::new(
        id,
        ReviewSourceKind::GooglePlay,
        "com.example.app",
        "user",
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).single().unwrap(),
        4,
        text,
        "",
    )
}

fn page(reviews: Vec<ReviewRecord>) -> Result<ReviewPage, SourceError> {
    Ok(ReviewPage {
        reviews,
        next: None,
    })
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        chunk_size: 2,
        api_call_delay: Duration::ZERO,
        // Keep the fixed 2026-03-02 fixture dates inside the lookback window
        // regardless of when the suite runs.
        scrape_days: 36500,
        ..PipelineConfig::default()
    }
}

fn games_request() -> RunRequest {
    RunRequest::new(Industry::Games).with_google_app_id("com.example.app")
}

#[tokio::test]
async fn full_run_dedupes_classifies_and_persists() {
    let store = Arc::new(MemoryReviewStore::with_existing(vec![review(
        "seen", "old text",
    )]));
    let classifier = ScriptedClassifier::new();
    let sink = Arc::new(BufferSink::new());
    let pipeline = ReviewPipeline::new(test_config(), store.clone(), sink.clone())
        .unwrap()
        .with_classifier(classifier.clone());

    // 5 scraped, 1 already stored, 1 empty-text -> 4 novel, 3 inference calls.
    let source = StaticSource::new(
        ReviewSourceKind::GooglePlay,
        "com.example.app",
        vec![page(vec![
            review("seen", "repeat"),
            review("n1", "love it"),
            review("n2", "garbled nonsense"),
            review("n3", "   "),
            review("n4", "crashes a lot"),
        ])],
    );

    let summary = pipeline
        .run_with_sources(&games_request(), vec![source])
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.scraped, 5);
    assert_eq!(summary.novel, 4);
    // Empty-text record keeps its sentinel topic and is not persisted.
    assert_eq!(summary.synced, 3);
    assert_eq!(classifier.call_count(), 3);

    let rows = store.rows();
    assert_eq!(rows.len(), 4); // 1 pre-existing + 3 newly synced
    assert!(rows.iter().all(|r| r.id != "n3"));
    let garbled = rows.iter().find(|r| r.id == "n2").unwrap();
    assert_eq!(garbled.sentiment, "Error");
    assert_eq!(garbled.topic, CATCH_ALL_TOPIC);
    for row in rows.iter().filter(|r| r.id.starts_with('n')) {
        assert!(Industry::Games.contains_topic(&row.topic));
    }
}

#[tokio::test]
async fn chunking_conserves_the_novel_record_count() {
    let store = Arc::new(MemoryReviewStore::new());
    let classifier = ScriptedClassifier::new();
    let sink = Arc::new(BufferSink::new());
    let pipeline = ReviewPipeline::new(test_config(), store.clone(), sink.clone())
        .unwrap()
        .with_classifier(classifier.clone());

    let reviews: Vec<ReviewRecord> = (0..5).map(|i| review(&format!("r{i}"), "text")).collect();
    let source = StaticSource::new(ReviewSourceKind::GooglePlay, "com.example.app", vec![page(reviews)]);

    let summary = pipeline
        .run_with_sources(&games_request(), vec![source])
        .await
        .unwrap();

    // N=5, C=2 -> chunks of 2, 2, 1; every record classified exactly once.
    assert_eq!(classifier.call_count(), 5);
    assert_eq!(summary.synced, 5);
    let chunk_sizes: Vec<String> = sink
        .events()
        .iter()
        .filter(|e| e.message.starts_with("starting classification for a chunk of"))
        .map(|e| e.message.clone())
        .collect();
    assert_eq!(chunk_sizes.len(), 3);
    assert!(chunk_sizes[0].ends_with("of 2 reviews"));
    assert!(chunk_sizes[1].ends_with("of 2 reviews"));
    assert!(chunk_sizes[2].ends_with("of 1 reviews"));
}

#[tokio::test]
async fn one_failed_source_does_not_abort_the_other() {
    let store = Arc::new(MemoryReviewStore::new());
    let classifier = ScriptedClassifier::new();
    let sink = Arc::new(BufferSink::new());
    let pipeline = ReviewPipeline::new(test_config(), store.clone(), sink.clone())
        .unwrap()
        .with_classifier(classifier);

    let broken = StaticSource::new(
        ReviewSourceKind::GooglePlay,
        "com.example.app",
        vec![Err(SourceError::HttpStatus {
            status: 503,
            url: "https://play.example/unavailable".into(),
        })],
    );
    let healthy = StaticSource::new(
        ReviewSourceKind::AppStore,
        "example-app",
        vec![page(vec![review("a1", "fine app")])],
    );

    let request = RunRequest::new(Industry::Games)
        .with_google_app_id("com.example.app")
        .with_apple_app("example-app", "in");
    let summary = pipeline
        .run_with_sources(&request, vec![broken, healthy])
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.scraped, 1);
    assert_eq!(summary.synced, 1);
    assert!(sink
        .events()
        .iter()
        .any(|e| e.level == Level::Warn && e.stage == Stage::Scrape));
}

#[tokio::test]
async fn empty_scrape_completes_as_a_no_op() {
    let store = Arc::new(MemoryReviewStore::new());
    let pipeline = ReviewPipeline::new(
        test_config(),
        store.clone(),
        Arc::new(BufferSink::new()),
    )
    .unwrap();

    let source = StaticSource::new(ReviewSourceKind::GooglePlay, "com.example.app", vec![]);
    let summary = pipeline
        .run_with_sources(&games_request(), vec![source])
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::NoReviews);
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn everything_already_stored_short_circuits_before_classification() {
    let store = Arc::new(MemoryReviewStore::with_existing(vec![review("a", "x")]));
    let classifier = ScriptedClassifier::new();
    let pipeline = ReviewPipeline::new(
        test_config(),
        store.clone(),
        Arc::new(BufferSink::new()),
    )
    .unwrap()
    .with_classifier(classifier.clone());

    let source = StaticSource::new(
        ReviewSourceKind::GooglePlay,
        "com.example.app",
        vec![page(vec![review("a", "x")])],
    );
    let summary = pipeline
        .run_with_sources(&games_request(), vec![source])
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::NoNewReviews);
    assert_eq!(classifier.call_count(), 0);
}

#[tokio::test]
async fn failed_existing_id_lookup_aborts_the_run() {
    let store = Arc::new(MemoryReviewStore::new().failing_reads());
    let sink = Arc::new(BufferSink::new());
    let pipeline = ReviewPipeline::new(test_config(), store, sink.clone())
        .unwrap()
        .with_classifier(ScriptedClassifier::new());

    let source = StaticSource::new(
        ReviewSourceKind::GooglePlay,
        "com.example.app",
        vec![page(vec![review("a", "x")])],
    );
    let err = pipeline
        .run_with_sources(&games_request(), vec![source])
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Dedup(_)));
    assert!(sink
        .events()
        .iter()
        .any(|e| e.level == Level::Error && e.stage == Stage::Dedup));
}

#[tokio::test]
async fn failed_batch_writes_log_and_continue() {
    let store = Arc::new(MemoryReviewStore::new().failing_writes());
    let sink = Arc::new(BufferSink::new());
    let pipeline = ReviewPipeline::new(test_config(), store, sink.clone())
        .unwrap()
        .with_classifier(ScriptedClassifier::new());

    let reviews: Vec<ReviewRecord> = (0..4).map(|i| review(&format!("r{i}"), "text")).collect();
    let source = StaticSource::new(ReviewSourceKind::GooglePlay, "com.example.app", vec![page(reviews)]);

    let summary = pipeline
        .run_with_sources(&games_request(), vec![source])
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.synced, 0);
    let failed_chunks = sink
        .events()
        .iter()
        .filter(|e| e.message.contains("chunk sync failed"))
        .count();
    assert_eq!(failed_chunks, 2); // both chunks failed, loop kept going
}

#[tokio::test]
async fn classifier_calls_fail_fast_when_the_provider_stalls() {
    // Accepts connections and never answers, like a wedged inference backend.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            open.push(stream);
        }
    });

    let config = PipelineConfig {
        http_timeout_secs: 1,
        ..PipelineConfig::default()
    };
    let classifier = GeminiClient::new(config.http_client().unwrap(), "test-key", "test-model")
        .with_base_url(format!("http://{addr}"));

    let err = classifier
        .classify("slow review", Industry::Games.topics())
        .await
        .unwrap_err();
    assert!(matches!(err, ClassifyError::Request(_)));
}

#[tokio::test]
async fn missing_identifiers_abort_before_any_side_effect() {
    let store = Arc::new(MemoryReviewStore::new());
    let pipeline = ReviewPipeline::new(
        test_config(),
        store.clone(),
        Arc::new(BufferSink::new()),
    )
    .unwrap();

    let err = pipeline
        .run_with_sources(&RunRequest::new(Industry::Grocery), vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn missing_classifier_credentials_abort_after_dedup() {
    let store = Arc::new(MemoryReviewStore::new());
    let sink = Arc::new(BufferSink::new());
    let pipeline = ReviewPipeline::new(test_config(), store.clone(), sink.clone()).unwrap();

    let source = StaticSource::new(
        ReviewSourceKind::GooglePlay,
        "com.example.app",
        vec![page(vec![review("a", "x")])],
    );
    let err = pipeline
        .run_with_sources(&games_request(), vec![source])
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Config(_)));
    assert!(store.rows().is_empty());
    assert!(sink
        .events()
        .iter()
        .any(|e| e.stage == Stage::Classify && e.level == Level::Error));
}
