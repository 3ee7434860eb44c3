//! Intent routing: STATIC (answerable from entity fields) or DYNAMIC
//! (needs retrieval and generation).
//!
//! # Stages
//!
//! 1. **Cache**: `intent:<sha256 hex of the normalized text>`. A hit is
//!    returned with `source = cache`.
//! 2. **Heuristic**: a closed set of cue words. A cue contained in the
//!    normalized text, starting at a word boundary, yields
//!    `(STATIC, 1.0, heuristic, cue)`.
//! 3. **Model** (optional, `router.model_enabled`): asked only when no cue
//!    matched, within `router.model_deadline_ms`. Any error, including a
//!    timeout, falls through to the heuristic default.
//! 4. **Default**: `(DYNAMIC, 0.0, heuristic)`.
//!
//! The verdict is written back with `cache.intent_ttl_secs`, including the
//! default reached after a failed model call, so a query that stalls the
//! model is not sent to it again until the entry expires.
//!
//! Word boundaries are Unicode-aware. Queries written without any cue, including every non-Latin query under the default English cue set,
//! route DYNAMIC.
//!
//! [`IntentRouter::route`] never fails; the pipeline applies the
//! [`IntentVerdict::fallback`] verdict when routing overruns its deadline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::CacheClient;
use crate::config::RouterConfig;
use crate::generator::{GenerationRequest, Generator};
use crate::models::{normalize, IntentLabel, IntentSource, IntentVerdict};

pub const INTENT_PREFIX: &str = "intent:";

/// Anything that can label a query. The pipeline depends on this rather
/// than on [`IntentRouter`] directly.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn route(&self, text: &str) -> IntentVerdict;

    /// Extra time the caller should allow beyond its routing deadline for
    /// slow stages such as a model call.
    fn stage_budget(&self) -> Duration {
        Duration::ZERO
    }
}

/// Cache key for a query: `intent:` + hex SHA-256 of its normalized form.
pub fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(text).as_bytes());
    format!("{}{}", INTENT_PREFIX, hex::encode(hasher.finalize()))
}

/// Deterministic cue matcher.
#[derive(Debug, Clone)]
pub struct CueSet {
    cues: Vec<String>,
}

impl CueSet {
    pub fn new(cues: &[String]) -> Self {
        let cues = cues
            .iter()
            .map(|c| normalize(c))
            .filter(|c| !c.is_empty())
            .collect();
        Self { cues }
    }

    /// Return the first cue contained in `normalized`.
    ///
    /// A cue must start at a word boundary (start of text or after a
    /// non-alphanumeric character such as a space or `-`). It may run on
    /// into a longer word, so `leader` matches "leadership" and `cve`
    /// matches "cve-2024-1234". The returned cue is always a substring of
    /// `normalized`.
    pub fn find(&self, normalized: &str) -> Option<String> {
        self.cues
            .iter()
            .find(|cue| starts_a_word(normalized, cue))
            .cloned()
    }
}

fn starts_a_word(text: &str, cue: &str) -> bool {
    text.match_indices(cue).any(|(at, _)| {
        text[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}

const MODEL_SYSTEM_PROMPT: &str = "You label questions sent to an open-source foundation's assistant. \
Reply with a single JSON object and nothing else: {\"label\": \"STATIC\" | \"DYNAMIC\", \"confidence\": <0..1>}. \
STATIC means the question asks for one fact stored on a single project, chapter, committee, event, or member \
(leaders, links, dates, level). DYNAMIC means anything else.";

#[derive(Deserialize)]
struct ModelReply {
    label: String,
    confidence: f64,
}

const DEFAULT_MODEL_DEADLINE: Duration = Duration::from_millis(2000);

/// Optional second opinion from the generator model.
pub struct ModelIntentStage {
    generator: Arc<dyn Generator>,
    deadline: Duration,
}

impl ModelIntentStage {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            deadline: DEFAULT_MODEL_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Ask the model for a verdict. Overrunning the stage deadline is an error.
    pub async fn classify(&self, text: &str) -> Result<IntentVerdict> {
        let request = GenerationRequest {
            system: MODEL_SYSTEM_PROMPT,
            context: None,
            user: text,
        };
        let raw = tokio::time::timeout(self.deadline, self.generator.generate(&request))
            .await
            .map_err(|_| anyhow::anyhow!("model intent stage timed out after {:?}", self.deadline))??;
        parse_model_reply(&raw)
    }
}

fn parse_model_reply(raw: &str) -> Result<IntentVerdict> {
    let start = raw.find('{').context("model reply has no JSON object")?;
    let end = raw.rfind('}').context("model reply has no JSON object")?;
    if end < start {
        bail!("model reply has no JSON object");
    }
    let reply: ModelReply =
        serde_json::from_str(&raw[start..=end]).context("model reply is not a verdict")?;
    let label = match reply.label.trim().to_uppercase().as_str() {
        "STATIC" => IntentLabel::Static,
        "DYNAMIC" => IntentLabel::Dynamic,
        other => bail!("model returned unknown label {}", other),
    };
    if !reply.confidence.is_finite() {
        bail!("model returned a non-finite confidence");
    }
    Ok(IntentVerdict::new(label, reply.confidence, IntentSource::Model))
}

/// Cached, fail-open intent router.
pub struct IntentRouter {
    cache: CacheClient,
    cues: CueSet,
    ttl: Duration,
    model: Option<ModelIntentStage>,
}

impl IntentRouter {
    pub fn new(cache: CacheClient, config: &RouterConfig, ttl: Duration) -> Self {
        Self {
            cache,
            cues: CueSet::new(&config.cues),
            ttl,
            model: None,
        }
    }

    pub fn with_model(mut self, model: ModelIntentStage) -> Self {
        self.model = Some(model);
        self
    }

    /// Classify without touching the cache.
    pub async fn classify(&self, normalized: &str) -> IntentVerdict {
        if let Some(cue) = self.cues.find(normalized) {
            return IntentVerdict::cue_match(cue);
        }
        if let Some(model) = &self.model {
            match model.classify(normalized).await {
                Ok(verdict) => return verdict,
                Err(e) => warn!(error = %e, "model intent stage failed; using heuristic default"),
            }
        }
        IntentVerdict::default_dynamic()
    }

    async fn cached(&self, key: &str) -> Option<IntentVerdict> {
        let raw = self.cache.get(key).await?;
        match serde_json::from_str::<IntentVerdict>(&raw) {
            Ok(v) => Some(v.with_source(IntentSource::Cache)),
            Err(e) => {
                warn!(key, error = %e, "ignoring malformed cached verdict");
                None
            }
        }
    }
}

#[async_trait]
impl IntentClassifier for IntentRouter {
    fn stage_budget(&self) -> Duration {
        self.model.as_ref().map_or(Duration::ZERO, ModelIntentStage::deadline)
    }

    async fn route(&self, text: &str) -> IntentVerdict {
        let normalized = normalize(text);
        let key = cache_key(&normalized);

        if let Some(verdict) = self.cached(&key).await {
            debug!(label = %verdict.label, "intent cache hit");
            return verdict;
        }

        let verdict = self.classify(&normalized).await;
        match serde_json::to_string(&verdict) {
            Ok(raw) => self.cache.set(&key, &raw, self.ttl).await,
            Err(e) => warn!(error = %e, "failed to serialize verdict"),
        }
        debug!(label = %verdict.label, confidence = verdict.confidence, source = ?verdict.source, "routed");
        verdict
    }
}
