//! The question pipeline: one chat message in, at most one envelope out.
//!
//! ```text
//! admit ─► (passive? is_question) ─► route ─► gate ─┬─► static lookup ─► static_lookup
//!   │              │                                 │        │ miss
//!   ▼              ▼                                 │        ▼
//! rate_limited   (none)                   low conf ◄─┘       RAG ─► rag | abstention
//!                                          system
//! ```
//!
//! | Step | Failure behaviour |
//! |------|-------------------|
//! | Admission | cache down → admit |
//! | Question filter (passive only) | not a question → no envelope |
//! | Routing | deadline (plus the model stage budget) overrun → `(DYNAMIC, 0.0, fallback)` |
//! | Confidence gate | STATIC below threshold → clarification |
//! | Static lookup | miss or error → RAG |
//! | RAG | any failure or deadline overrun → abstention |
//!
//! [`Pipeline::process`] never fails. Each call runs in an `ask` tracing
//! span carrying a fresh request id. Dropping the returned future cancels
//! in-flight work at its next await point and produces nothing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, info_span, warn, Instrument};

use crate::cache::CacheClient;
use crate::config::Config;
use crate::detector::{ModelTopicClassifier, QuestionDetector};
use crate::embedding::create_provider;
use crate::generator::create_generator;
use crate::lookup::StaticLookupService;
use crate::models::{
    EntityKind, IntentLabel, IntentVerdict, Query, ResponseEnvelope, ResponseSource,
};
use crate::rag::{RagAgent, RagOutcome};
use crate::rate_limit::RateLimiter;
use crate::router::{IntentClassifier, IntentRouter, ModelIntentStage};
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

pub const THROTTLED_MESSAGE: &str =
    "You're asking faster than I can keep up. Please wait a minute and try again.";
pub const EMPTY_QUERY_MESSAGE: &str = "Please type a question and I'll do my best to help.";
pub const CLARIFY_MESSAGE: &str =
    "I'm not sure what you're referring to. Could you name the project, chapter, or event more precisely?";
pub const ABSTAIN_MESSAGE: &str =
    "I couldn't find anything about that in the foundation's documents. Try the manual search instead.";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub confidence_threshold: f64,
    pub router_deadline: Duration,
    pub retrieval_deadline: Duration,
    pub allowed_kinds: Vec<EntityKind>,
    /// Append failure reasons to user-facing messages.
    pub development: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confidence_threshold: config.router.confidence_threshold,
            router_deadline: Duration::from_millis(config.router.deadline_ms),
            retrieval_deadline: Duration::from_secs(config.retrieval.deadline_secs),
            allowed_kinds: config.retrieval.kinds.clone(),
            development: config.pipeline.is_development(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
            router_deadline: Duration::from_millis(50),
            retrieval_deadline: Duration::from_secs(20),
            allowed_kinds: Vec::new(),
            development: false,
        }
    }
}

pub struct Pipeline {
    settings: PipelineSettings,
    limiter: RateLimiter,
    detector: QuestionDetector,
    router: Arc<dyn IntentClassifier>,
    lookup: StaticLookupService,
    rag: RagAgent,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        limiter: RateLimiter,
        detector: QuestionDetector,
        router: Arc<dyn IntentClassifier>,
        lookup: StaticLookupService,
        rag: RagAgent,
    ) -> Self {
        Self {
            settings,
            limiter,
            detector,
            router,
            lookup,
            rag,
        }
    }

    /// Wire the production pipeline: shared cache, SQLite read model, and
    /// the configured embedding and generator providers.
    ///
    /// # Errors
    ///
    /// Misconfiguration only (missing credentials, unknown providers,
    /// unreadable database). Backends being down is not an error here.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let cache = CacheClient::shared(&config.cache).await?;

        let pool = db::connect(&config.db).await?;
        migrate::run_migrations(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));

        let embedder = create_provider(&config.embedding)?;
        let generator = create_generator(&config.generator)?;

        let mut router = IntentRouter::new(
            cache.clone(),
            &config.router,
            Duration::from_secs(config.cache.intent_ttl_secs),
        );
        if config.router.model_enabled {
            router = router.with_model(
                ModelIntentStage::new(generator.clone())
                    .with_deadline(Duration::from_millis(config.router.model_deadline_ms)),
            );
        }

        let mut detector = QuestionDetector::new(&config.detector);
        if config.detector.classifier_enabled {
            detector = detector.with_classifier(Arc::new(ModelTopicClassifier::new(
                generator.clone(),
            )));
        }

        info!(
            cache = cache.backend_name(),
            embedder = embedder.model_name(),
            generator = generator.model_name(),
            "pipeline ready"
        );

        Ok(Self::new(
            PipelineSettings::from_config(config),
            RateLimiter::new(cache, &config.rate_limit),
            detector,
            Arc::new(router),
            StaticLookupService::new(store.clone()),
            RagAgent::new(
                embedder,
                store,
                generator,
                config.retrieval.k,
                config.generator.max_answer_chars,
            ),
        ))
    }

    /// Handle one message. `None` means "stay silent".
    pub async fn process(&self, query: &Query) -> Option<ResponseEnvelope> {
        let span = info_span!(
            "ask",
            request_id = %uuid::Uuid::new_v4(),
            user_id = %query.user_id,
            channel_id = %query.channel_id.as_deref().unwrap_or("-"),
            explicit = query.is_explicit
        );
        self.run(query.clone().bounded()).instrument(span).await
    }

    async fn run(&self, query: Query) -> Option<ResponseEnvelope> {
        if !self.limiter.is_allowed(&query.user_id).await {
            info!("request throttled");
            return Some(ResponseEnvelope::new(
                THROTTLED_MESSAGE,
                ResponseSource::RateLimited,
            ));
        }

        if !query.is_explicit && !self.detector.is_question(&query.text).await {
            return None;
        }

        if query.text.is_empty() {
            return Some(ResponseEnvelope::new(
                self.message(EMPTY_QUERY_MESSAGE, "the message was empty"),
                ResponseSource::System,
            ));
        }

        let router_deadline = self.settings.router_deadline + self.router.stage_budget();
        let verdict = match tokio::time::timeout(router_deadline, self.router.route(&query.text)).await
        {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(deadline = ?router_deadline, "routing overran its deadline");
                IntentVerdict::fallback()
            }
        };

        if verdict.label == IntentLabel::Static {
            if verdict.confidence < self.settings.confidence_threshold {
                info!(confidence = verdict.confidence, "static intent below threshold");
                let reason = format!(
                    "intent confidence {:.2} is below {:.2}",
                    verdict.confidence, self.settings.confidence_threshold
                );
                return Some(
                    ResponseEnvelope::new(self.message(CLARIFY_MESSAGE, &reason), ResponseSource::System)
                        .with_intent(&verdict),
                );
            }

            if let Some(handle) = self.lookup.resolve(&query.text).await {
                info!(kind = %handle.kind, key = %handle.key, "answered from entity fields");
                return Some(
                    ResponseEnvelope::new(self.lookup.format(&handle), ResponseSource::StaticLookup)
                        .with_intent(&verdict)
                        .with_manual_search(),
                );
            }
            info!("static lookup missed; falling back to retrieval");
        }

        let outcome = tokio::time::timeout(
            self.settings.retrieval_deadline,
            self.rag.answer(&query.text, &self.settings.allowed_kinds),
        )
        .await;

        let envelope = match outcome {
            Ok(RagOutcome::Answer { text, citations }) => {
                let mut envelope = ResponseEnvelope::new(text, ResponseSource::Rag).with_intent(&verdict);
                envelope.citations = citations;
                envelope
            }
            Ok(RagOutcome::Abstain(reason)) => {
                info!(reason = reason.describe(), "abstaining");
                self.abstention(&verdict, reason.describe())
            }
            Err(_) => {
                warn!(deadline = ?self.settings.retrieval_deadline, "retrieval overran its deadline");
                self.abstention(&verdict, "retrieval timed out")
            }
        };
        Some(envelope)
    }

    fn abstention(&self, verdict: &IntentVerdict, reason: &str) -> ResponseEnvelope {
        ResponseEnvelope::new(self.message(ABSTAIN_MESSAGE, reason), ResponseSource::Abstention)
            .with_intent(verdict)
            .with_manual_search()
    }

    fn message(&self, base: &str, reason: &str) -> String {
        if self.settings.development {
            format!("{} (development: {})", base, reason)
        } else {
            base.to_string()
        }
    }
}
