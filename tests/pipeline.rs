//! End-to-end tests for the question pipeline.
//!
//! Every collaborator is in-process: the memory cache (or a cache that fails
//! every call), the in-memory entity/chunk store, a constant embedder, and a
//! canned generator. Time-dependent cases run on a paused tokio clock.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ask_harness::cache::{CacheBackend, CacheClient, CacheScript, MemoryBackend};
use ask_harness::config::{DetectorConfig, RateLimitConfig, RouterConfig};
use ask_harness::detector::QuestionDetector;
use ask_harness::embedding::EmbeddingProvider;
use ask_harness::generator::{GenerationRequest, Generator};
use ask_harness::lookup::StaticLookupService;
use ask_harness::models::{
    Chunk, ContextRef, EntityKind, EntityRecord, IntentLabel, IntentSource, IntentVerdict, Query,
    ResponseSource,
};
use ask_harness::pipeline::{Pipeline, PipelineSettings, CLARIFY_MESSAGE, THROTTLED_MESSAGE};
use ask_harness::rag::RagAgent;
use ask_harness::rate_limit::RateLimiter;
use ask_harness::router::{IntentClassifier, IntentRouter, ModelIntentStage};
use ask_harness::store::{EntityStore, MemoryStore};

// ─── Stub collaborators ─────────────────────────────────────────────

/// A cache whose every operation fails, as if the server were unreachable.
#[derive(Default)]
struct UnreachableCache {
    calls: AtomicUsize,
}

#[async_trait]
impl CacheBackend for UnreachableCache {
    fn name(&self) -> &str {
        "unreachable"
    }
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("connection refused")
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("connection refused")
    }
    async fn eval_script(
        &self,
        _script: CacheScript,
        _keys: &[String],
        _args: &[String],
    ) -> Result<i64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("connection refused")
    }
}

/// Maps every text onto the same unit vector so every chunk is a hit.
struct ConstantEmbedder;

#[async_trait]
impl EmbeddingProvider for ConstantEmbedder {
    fn model_name(&self) -> &str {
        "constant"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.0, 1.0, 0.0]).collect())
    }
}

/// Returns a fixed reply, optionally after a delay.
struct CannedGenerator {
    reply: String,
    delay: Duration,
    calls: AtomicUsize,
}

impl CannedGenerator {
    fn new(reply: &str) -> Arc<Self> {
        Self::slow(reply, Duration::ZERO)
    }

    fn slow(reply: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Generator for CannedGenerator {
    fn model_name(&self) -> &str {
        "canned"
    }
    async fn generate(&self, _request: &GenerationRequest<'_>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.reply.clone())
    }
}

/// A router that always returns the same verdict.
struct FixedRouter(IntentVerdict);

#[async_trait]
impl IntentClassifier for FixedRouter {
    async fn route(&self, _text: &str) -> IntentVerdict {
        self.0.clone()
    }
}

/// Collects formatted log lines from a thread-local subscriber.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .without_time()
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn lines(&self) -> Vec<String> {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf).lines().map(str::to_string).collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());

    let mut alpha = EntityRecord::new(EntityKind::Project, "alpha", "Alpha");
    alpha.leaders = vec!["Alice".into()];
    alpha.private = serde_json::json!({ "email": "alice@example.org" });
    store.upsert_entity(&alpha).await.unwrap();

    let mut x = EntityRecord::new(EntityKind::Project, "x", "X");
    x.description = Some("A fuzzing toolkit.".into());
    store.upsert_entity(&x).await.unwrap();

    let mut z = EntityRecord::new(EntityKind::Event, "z", "Event Z");
    z.starts_at = chrono::NaiveDate::from_ymd_opt(2025, 9, 1);
    z.location = Some("Lisbon".into());
    store.upsert_entity(&z).await.unwrap();

    let chunks = [
        ("x-1", EntityKind::Project, "x", "X is a fuzzing toolkit for web services."),
        ("z-1", EntityKind::Event, "z", "Event Z opens on September 1 in Lisbon."),
        ("y-1", EntityKind::Event, "y", "Event Y moved to a new venue downtown."),
    ];
    for (id, kind, key, text) in chunks {
        store
            .insert_chunk(Chunk {
                id: id.into(),
                text: text.into(),
                embedding: vec![0.0, 1.0, 0.0],
                context_ref: ContextRef::new(kind, key),
                created_at: 0,
            })
            .unwrap();
    }
    store
}

struct Harness {
    cache: CacheClient,
    store: Arc<MemoryStore>,
    generator: Arc<CannedGenerator>,
    router: Option<Arc<dyn IntentClassifier>>,
    rate_limit: RateLimitConfig,
    settings: PipelineSettings,
}

impl Harness {
    async fn new(reply: &str) -> Self {
        Self {
            cache: CacheClient::new(Arc::new(MemoryBackend::new())),
            store: seeded_store().await,
            generator: CannedGenerator::new(reply),
            router: None,
            rate_limit: RateLimitConfig::default(),
            settings: PipelineSettings::default(),
        }
    }

    fn build(self) -> Pipeline {
        let router = self.router.unwrap_or_else(|| {
            Arc::new(IntentRouter::new(
                self.cache.clone(),
                &RouterConfig::default(),
                Duration::from_secs(3600),
            ))
        });
        Pipeline::new(
            self.settings,
            RateLimiter::new(self.cache, &self.rate_limit),
            QuestionDetector::new(&DetectorConfig::default()),
            router,
            StaticLookupService::new(self.store.clone()),
            RagAgent::new(
                Arc::new(ConstantEmbedder),
                self.store,
                self.generator,
                8,
                1800,
            ),
        )
    }
}

fn explicit(text: &str) -> Query {
    Query::new(text, "u1", None, true)
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn static_hit_answers_from_entity_fields() {
    let harness = Harness::new("unused").await;
    let generator = harness.generator.clone();
    let pipeline = harness.build();

    let env = pipeline
        .process(&explicit("Who is the leader of project alpha?"))
        .await
        .expect("explicit queries always get an envelope");

    assert_eq!(env.source, ResponseSource::StaticLookup);
    let intent = env.intent.unwrap();
    assert_eq!(intent.label, IntentLabel::Static);
    assert_eq!(intent.confidence, 1.0);
    assert!(env.answer.contains("Alice"));
    assert!(!env.answer.contains("alice@example.org"));
    assert!(env.show_manual_search);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn low_confidence_static_asks_for_clarification() {
    let mut harness = Harness::new("unused").await;
    harness.router = Some(Arc::new(FixedRouter(IntentVerdict::new(
        IntentLabel::Static,
        0.40,
        IntentSource::Model,
    ))));
    let pipeline = harness.build();

    let env = pipeline.process(&explicit("Tell me about alpha")).await.unwrap();

    assert_eq!(env.source, ResponseSource::System);
    let intent = env.intent.unwrap();
    assert_eq!(intent.label, IntentLabel::Static);
    assert_eq!(intent.confidence, 0.40);
    assert_eq!(env.answer, CLARIFY_MESSAGE);
}

#[tokio::test]
async fn cache_outage_routes_dynamic_and_still_answers() {
    let backend = Arc::new(UnreachableCache::default());
    let mut harness = Harness::new("X is a fuzzing toolkit for web services.").await;
    harness.cache = CacheClient::new(backend.clone());
    let pipeline = harness.build();

    let env = pipeline.process(&explicit("What is X?")).await.unwrap();

    assert_eq!(env.source, ResponseSource::Rag);
    let intent = env.intent.unwrap();
    assert_eq!(intent.label, IntentLabel::Dynamic);
    assert_eq!(intent.confidence, 0.0);
    assert!(env.answer.contains("fuzzing toolkit"));
    // Limiter script, router read, router write.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn twenty_first_request_is_throttled_until_window_passes() {
    let pipeline = Harness::new("unused").await.build();
    let query = explicit("Who is the leader of project alpha?");

    for _ in 0..20 {
        let env = pipeline.process(&query).await.unwrap();
        assert_eq!(env.source, ResponseSource::StaticLookup);
    }

    let env = pipeline.process(&query).await.unwrap();
    assert_eq!(env.source, ResponseSource::RateLimited);
    assert_eq!(env.answer, THROTTLED_MESSAGE);
    assert!(env.intent.is_none());

    tokio::time::advance(Duration::from_secs(61)).await;

    let env = pipeline.process(&query).await.unwrap();
    assert_eq!(env.source, ResponseSource::StaticLookup);
}

#[tokio::test]
async fn throttling_is_per_user() {
    let mut harness = Harness::new("unused").await;
    harness.rate_limit = RateLimitConfig {
        max_requests: 1,
        window_secs: 60,
    };
    let pipeline = harness.build();

    let first = Query::new("Who is the leader of project alpha?", "u1", None, true);
    let other = Query::new("Who is the leader of project alpha?", "u2", None, true);
    pipeline.process(&first).await.unwrap();
    let denied = pipeline.process(&first).await.unwrap();
    assert_eq!(denied.source, ResponseSource::RateLimited);

    let env = pipeline.process(&other).await.unwrap();
    assert_eq!(env.source, ResponseSource::StaticLookup);
}

#[tokio::test]
async fn passive_small_talk_is_suppressed() {
    let pipeline = Harness::new("unused").await.build();
    let out = pipeline
        .process(&Query::new("hello team", "u1", None, false))
        .await;
    assert!(out.is_none());
}

#[tokio::test]
async fn passive_domain_question_is_answered() {
    let pipeline = Harness::new("unused").await.build();
    let env = pipeline
        .process(&Query::new(
            "does anyone know who is the leader of project alpha?",
            "u1",
            None,
            false,
        ))
        .await
        .unwrap();
    assert_eq!(env.source, ResponseSource::StaticLookup);
}

#[tokio::test]
async fn rag_drops_chunk_with_missing_owner() {
    let logs = CapturedLogs::default();
    let _guard = logs.install();
    let pipeline = Harness::new("Event Z opens on September 1 in Lisbon.").await.build();

    let env = pipeline
        .process(&explicit("When does event Z start?"))
        .await
        .unwrap();

    assert_eq!(env.source, ResponseSource::Rag);
    assert_eq!(env.intent.unwrap().label, IntentLabel::Dynamic);
    assert!(!env.show_manual_search);
    assert_eq!(env.citations.len(), 1);
    assert_eq!(env.citations[0].chunk_id, "z-1");
    assert_eq!(env.citations[0].key, "z");
    assert!(!env.answer.contains("Event Y"));

    let dropped: Vec<String> = logs
        .lines()
        .into_iter()
        .filter(|l| l.contains("WARN") && l.contains("chunk_id=y-1"))
        .collect();
    assert_eq!(dropped.len(), 1, "{:?}", logs.lines());
    assert!(dropped[0].contains("dropping retrieved chunk"));
}

#[tokio::test(start_paused = true)]
async fn slow_model_stage_fits_its_own_budget_and_is_cached() {
    let model = CannedGenerator::slow(
        r#"{"label": "STATIC", "confidence": 0.9}"#,
        Duration::from_millis(200),
    );
    let mut harness = Harness::new("unused").await;
    harness.router = Some(Arc::new(
        IntentRouter::new(
            harness.cache.clone(),
            &RouterConfig::default(),
            Duration::from_secs(3600),
        )
        .with_model(ModelIntentStage::new(model.clone())),
    ));
    let pipeline = harness.build();

    for _ in 0..3 {
        let env = pipeline.process(&explicit("Tell me about alpha")).await.unwrap();
        let intent = env.intent.unwrap();
        assert_eq!(intent.label, IntentLabel::Static);
        assert_eq!(intent.confidence, 0.9);
    }
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_span_carries_channel_id() {
    let logs = CapturedLogs::default();
    let _guard = logs.install();
    let pipeline = Harness::new("unused").await.build();

    let query = Query::new(
        "Who is the leader of project alpha?",
        "u1",
        Some("C42".into()),
        true,
    );
    pipeline.process(&query).await.unwrap();

    let answered = logs
        .lines()
        .into_iter()
        .find(|l| l.contains("answered from entity fields"))
        .expect("static hit is logged");
    assert!(answered.contains("channel_id=C42"), "{}", answered);
    assert!(answered.contains("user_id=u1"), "{}", answered);
}

// ─── Properties ─────────────────────────────────────────────────────

#[tokio::test]
async fn processing_twice_gives_the_same_source_and_intent() {
    let pipeline = Harness::new("X is a fuzzing toolkit for web services.").await.build();

    for text in ["Who is the leader of project alpha?", "What is X?", "Tell me about alpha"] {
        let first = pipeline.process(&explicit(text)).await.unwrap();
        let second = pipeline.process(&explicit(text)).await.unwrap();
        assert_eq!(first.source, second.source, "source differs for {text:?}");
        assert_eq!(first.intent, second.intent, "intent differs for {text:?}");
    }
}

#[tokio::test]
async fn refusal_becomes_abstention_with_escape_hatch() {
    let pipeline = Harness::new("NO_ANSWER").await.build();
    let env = pipeline.process(&explicit("What is X?")).await.unwrap();
    assert_eq!(env.source, ResponseSource::Abstention);
    assert!(env.show_manual_search);
    assert_eq!(env.intent.unwrap().label, IntentLabel::Dynamic);
}

#[tokio::test(start_paused = true)]
async fn slow_generation_hits_the_retrieval_deadline() {
    let mut harness = Harness::new("unused").await;
    harness.generator = CannedGenerator::slow("X is a fuzzing toolkit.", Duration::from_secs(60));
    let pipeline = harness.build();

    let env = pipeline.process(&explicit("What is X?")).await.unwrap();
    assert_eq!(env.source, ResponseSource::Abstention);
    assert!(env.show_manual_search);
}

#[tokio::test(start_paused = true)]
async fn dropped_request_produces_nothing_and_leaves_pipeline_usable() {
    let mut harness = Harness::new("unused").await;
    harness.generator = CannedGenerator::slow("X is a fuzzing toolkit.", Duration::from_secs(5));
    let generator = harness.generator.clone();
    let pipeline = harness.build();

    let cancelled =
        tokio::time::timeout(Duration::from_secs(1), pipeline.process(&explicit("What is X?"))).await;
    assert!(cancelled.is_err());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    let env = pipeline
        .process(&explicit("Who is the leader of project alpha?"))
        .await
        .unwrap();
    assert_eq!(env.source, ResponseSource::StaticLookup);
}
