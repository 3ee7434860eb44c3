//! Core data models used throughout the question pipeline.
//!
//! These types describe a single request ([`Query`]), the router's
//! [`IntentVerdict`], the read-only entity and chunk records the pipeline
//! consumes, and the [`ResponseEnvelope`] handed back to chat clients.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Queries are capped at 4 KB of UTF-8 after trimming.
pub const MAX_QUERY_BYTES: usize = 4096;

/// An incoming chat message addressed to (or overheard by) the assistant.
#[derive(Debug, Clone, Deserialize)]
pub struct Query {
    pub text: String,
    pub user_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    /// `true` when the user mentioned the bot; `false` for passive channel monitoring.
    #[serde(default = "default_explicit")]
    pub is_explicit: bool,
}

fn default_explicit() -> bool {
    true
}

impl Query {
    pub fn new(
        text: impl Into<String>,
        user_id: impl Into<String>,
        channel_id: Option<String>,
        is_explicit: bool,
    ) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            channel_id,
            is_explicit,
        }
        .bounded()
    }

    /// Trim the text and cap it at [`MAX_QUERY_BYTES`] on a char boundary.
    pub fn bounded(mut self) -> Self {
        let trimmed = self.text.trim();
        let mut end = trimmed.len().min(MAX_QUERY_BYTES);
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        self.text = trimmed[..end].to_string();
        self
    }
}

/// Lowercase and trim; the canonical form for cache keys and cue matching.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Split normalized text into alphanumeric tokens (Unicode-aware).
pub fn tokens(text: &str) -> Vec<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .map(|t| t.trim_matches(|c: char| c == '-' || c == '_'))
        .filter(|t| !t.is_empty())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentLabel {
    #[serde(rename = "STATIC")]
    Static,
    #[serde(rename = "DYNAMIC")]
    Dynamic,
}

impl fmt::Display for IntentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentLabel::Static => write!(f, "STATIC"),
            IntentLabel::Dynamic => write!(f, "DYNAMIC"),
        }
    }
}

/// Where a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentSource {
    Heuristic,
    Model,
    Cache,
    Fallback,
}

/// Router output: a label, a confidence in `[0, 1]`, and its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentVerdict {
    pub label: IntentLabel,
    pub confidence: f64,
    pub source: IntentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_cue: Option<String>,
}

impl IntentVerdict {
    pub fn new(label: IntentLabel, confidence: f64, source: IntentSource) -> Self {
        Self {
            label,
            confidence: confidence.clamp(0.0, 1.0),
            source,
            matched_cue: None,
        }
    }

    /// A heuristic cue hit: `(STATIC, 1.0, heuristic, cue)`.
    pub fn cue_match(cue: impl Into<String>) -> Self {
        Self {
            matched_cue: Some(cue.into()),
            ..Self::new(IntentLabel::Static, 1.0, IntentSource::Heuristic)
        }
    }

    /// The heuristic default: `(DYNAMIC, 0.0, heuristic)`.
    pub fn default_dynamic() -> Self {
        Self::new(IntentLabel::Dynamic, 0.0, IntentSource::Heuristic)
    }

    /// The fail-open verdict: `(DYNAMIC, 0.0, fallback)`.
    pub fn fallback() -> Self {
        Self::new(IntentLabel::Dynamic, 0.0, IntentSource::Fallback)
    }

    pub fn with_source(mut self, source: IntentSource) -> Self {
        self.source = source;
        self
    }

    pub fn summary(&self) -> IntentSummary {
        IntentSummary {
            label: self.label,
            confidence: self.confidence,
        }
    }
}

/// The kinds of foundation entities the assistant knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Project,
    Chapter,
    Committee,
    Event,
    Member,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Project,
        EntityKind::Chapter,
        EntityKind::Committee,
        EntityKind::Event,
        EntityKind::Member,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Chapter => "chapter",
            EntityKind::Committee => "committee",
            EntityKind::Event => "event",
            EntityKind::Member => "member",
        }
    }

    /// Words in a query that refer to this kind.
    pub fn mention_words(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Project => &["project", "projects"],
            EntityKind::Chapter => &["chapter", "chapters"],
            EntityKind::Committee => &["committee", "committees"],
            EntityKind::Event => &["event", "events", "conference", "conferences"],
            EntityKind::Member => &["member", "members", "contributor", "contributors"],
        }
    }

    /// Kinds explicitly mentioned in a normalized query, in [`EntityKind::ALL`] order.
    pub fn mentioned_in(normalized: &str) -> Vec<EntityKind> {
        let toks = tokens(normalized);
        EntityKind::ALL
            .into_iter()
            .filter(|k| toks.iter().any(|t| k.mention_words().contains(t)))
            .collect()
    }

    /// Map a single token back to the kind it names, if any.
    pub fn from_mention(token: &str) -> Option<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.mention_words().contains(&token))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "project" => Ok(EntityKind::Project),
            "chapter" => Ok(EntityKind::Chapter),
            "committee" => Ok(EntityKind::Committee),
            "event" => Ok(EntityKind::Event),
            "member" => Ok(EntityKind::Member),
            other => bail!("unknown entity kind: {}", other),
        }
    }
}

/// Reference from a chunk to the entity that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextRef {
    pub kind: EntityKind,
    pub key: String,
}

impl ContextRef {
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into().to_lowercase(),
        }
    }
}

impl fmt::Display for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// An entity row as the ingestion collaborator stores it.
///
/// Everything not covered by [`PublicFields`] (contact e-mails, internal ids,
/// moderation notes, …) lives in `private` and is never rendered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: Option<EntityKind>,
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub leaders: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub starts_at: Option<NaiveDate>,
    #[serde(default)]
    pub ends_at: Option<NaiveDate>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub stars: Option<i64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub meetup_group: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub private: serde_json::Value,
}

impl EntityRecord {
    pub fn new(kind: EntityKind, key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            key: key.into().to_lowercase(),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn context_ref(&self) -> Option<ContextRef> {
        self.kind.map(|k| ContextRef::new(k, self.key.clone()))
    }

    /// Project the record onto its whitelisted fields.
    ///
    /// Returns `None` when a required field (kind, name) is missing, which
    /// callers treat as a contract violation and skip.
    pub fn public_fields(&self) -> Option<PublicFields> {
        self.kind?;
        let name = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?;
        Some(PublicFields {
            name: name.to_string(),
            description: non_blank(&self.description),
            leaders: self.leaders.iter().filter(|l| !l.trim().is_empty()).cloned().collect(),
            urls: self.urls.iter().filter(|u| !u.trim().is_empty()).cloned().collect(),
            tags: self.tags.iter().filter(|t| !t.trim().is_empty()).cloned().collect(),
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            level: non_blank(&self.level),
            stars: self.stars,
            location: non_blank(&self.location),
            region: non_blank(&self.region),
            meetup_group: non_blank(&self.meetup_group),
        })
    }

    /// Build the public handle for this record, if it is well formed.
    pub fn handle(&self) -> Option<EntityHandle> {
        Some(EntityHandle {
            kind: self.kind?,
            key: self.key.clone(),
            public_fields: self.public_fields()?,
        })
    }
}

fn non_blank(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The only entity surface the pipeline may expose.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicFields {
    pub name: String,
    pub description: Option<String>,
    pub leaders: Vec<String>,
    pub urls: Vec<String>,
    pub tags: Vec<String>,
    pub starts_at: Option<NaiveDate>,
    pub ends_at: Option<NaiveDate>,
    pub level: Option<String>,
    pub stars: Option<i64>,
    pub location: Option<String>,
    pub region: Option<String>,
    pub meetup_group: Option<String>,
}

impl PublicFields {
    /// Every string value in the whitelist, for safety assertions.
    pub fn values(&self) -> Vec<String> {
        let mut out = vec![self.name.clone()];
        out.extend(self.description.clone());
        out.extend(self.leaders.iter().cloned());
        out.extend(self.urls.iter().cloned());
        out.extend(self.tags.iter().cloned());
        out.extend(self.starts_at.map(|d| d.to_string()));
        out.extend(self.ends_at.map(|d| d.to_string()));
        out.extend(self.level.clone());
        out.extend(self.stars.map(|s| s.to_string()));
        out.extend(self.location.clone());
        out.extend(self.region.clone());
        out.extend(self.meetup_group.clone());
        out
    }
}

/// A resolved entity reduced to its public projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityHandle {
    pub kind: EntityKind,
    pub key: String,
    pub public_fields: PublicFields,
}

/// A short embedded text fragment owned by one entity.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub context_ref: ContextRef,
    pub created_at: i64,
}

/// A similarity search result with the owner resolved at query time.
///
/// `entity` is `None` when the owning entity no longer exists.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub text: String,
    pub similarity: f64,
    pub context_ref: ContextRef,
    pub entity: Option<EntityRecord>,
}

/// Which path produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    StaticLookup,
    Rag,
    System,
    RateLimited,
    Abstention,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentSummary {
    pub label: IntentLabel,
    pub confidence: f64,
}

/// A chunk that contributed to a `rag` answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub kind: EntityKind,
    pub key: String,
    pub name: String,
}

/// What the pipeline returns to the chat client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub answer: String,
    pub source: ResponseSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentSummary>,
    pub show_manual_search: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl ResponseEnvelope {
    pub fn new(answer: impl Into<String>, source: ResponseSource) -> Self {
        Self {
            answer: answer.into(),
            source,
            intent: None,
            show_manual_search: false,
            citations: Vec::new(),
        }
    }

    pub fn with_intent(mut self, verdict: &IntentVerdict) -> Self {
        self.intent = Some(verdict.summary());
        self
    }

    pub fn with_manual_search(mut self) -> Self {
        self.show_manual_search = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_is_trimmed_and_capped() {
        let q = Query::new("  hi  ", "u1", None, true);
        assert_eq!(q.text, "hi");

        let long = "é".repeat(3000);
        let q = Query::new(long, "u1", None, true);
        assert!(q.text.len() <= MAX_QUERY_BYTES);
        assert!(q.text.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_tokens_split_on_punctuation() {
        assert_eq!(
            tokens("who leads project alpha? (juice-shop)"),
            vec!["who", "leads", "project", "alpha", "juice-shop"]
        );
    }

    #[test]
    fn test_kind_mentions() {
        assert_eq!(
            EntityKind::mentioned_in("which chapters host events?"),
            vec![EntityKind::Chapter, EntityKind::Event]
        );
        assert!(EntityKind::mentioned_in("projection").is_empty());
    }

    #[test]
    fn test_verdict_serialization_shape() {
        let v = IntentVerdict::cue_match("leader");
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["label"], "STATIC");
        assert_eq!(json["source"], "heuristic");
        assert_eq!(json["matched_cue"], "leader");
        let back: IntentVerdict = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_public_fields_require_name() {
        let mut rec = EntityRecord::new(EntityKind::Project, "Alpha", "  ");
        assert!(rec.public_fields().is_none());
        rec.name = Some("Alpha".into());
        rec.private = serde_json::json!({ "email": "lead@example.org" });
        let public = rec.public_fields().unwrap();
        assert_eq!(public.name, "Alpha");
        assert!(!public.values().iter().any(|v| v.contains("lead@example.org")));
        assert_eq!(rec.key, "alpha");
    }

    #[test]
    fn test_envelope_source_names() {
        let env = ResponseEnvelope::new("x", ResponseSource::RateLimited);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["source"], "rate_limited");
        assert!(json.get("intent").is_none());
        assert!(json.get("citations").is_none());
    }
}
