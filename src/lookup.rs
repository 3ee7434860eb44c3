//! Deterministic answers from structured entity fields.
//!
//! [`StaticLookupService::resolve`] turns a query such as "who leads project
//! juice shop?" into an [`EntityHandle`]:
//!
//! 1. A kind word ("project", "chapters", "conference", …) becomes a kind hint.
//! 2. The one to three words right after the kind word (then right before
//!    it) are tried as a key (`juice-shop`) and as a name (`juice shop`),
//!    longest first.
//! 3. Remaining content words are tried the same way, without the hint.
//!
//! The first candidate the [`EntityStore`] knows wins. Store errors and
//! malformed records resolve to `None`.
//!
//! [`StaticLookupService::format`] renders the handle's public fields only.
//! Every value is escaped with [`escape_markdown`], and the query text is
//! never echoed back.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::models::{normalize, tokens, EntityHandle, EntityKind};
use crate::store::EntityStore;
use crate::text::{escape_markdown, truncate_chars};

/// Upper bound on store lookups per query.
const MAX_CANDIDATES: usize = 24;
const MAX_NGRAM: usize = 3;
const MAX_DESCRIPTION_CHARS: usize = 280;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "for", "to", "in", "on", "at", "by", "and", "or", "with", "about",
    "is", "are", "was", "were", "be", "does", "do", "did", "who", "what", "when", "where", "which",
    "how", "why", "can", "could", "i", "me", "my", "you", "your", "it", "its", "this", "that",
    "please", "tell", "show", "give", "find", "get", "leader", "leaders", "lead", "leads",
    "maintainer", "maintainers", "repo", "repository", "link", "links", "url", "website",
    "homepage", "contact", "version", "license", "download", "start", "starts", "owasp",
];

pub struct StaticLookupService {
    entities: Arc<dyn EntityStore>,
}

impl StaticLookupService {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }

    pub async fn resolve(&self, text: &str) -> Option<EntityHandle> {
        let normalized = normalize(text);
        for (kind, candidate) in candidates(&normalized) {
            let record = match self.entities.find_entity(kind, &candidate).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "entity lookup failed");
                    return None;
                }
            };
            return match record.handle() {
                Some(handle) => {
                    debug!(kind = %handle.kind, key = %handle.key, "static lookup hit");
                    Some(handle)
                }
                None => {
                    warn!(key = %record.key, "entity is missing required public fields; skipping");
                    None
                }
            };
        }
        None
    }

    /// Render a handle as a short markdown card.
    pub fn format(&self, handle: &EntityHandle) -> String {
        let f = &handle.public_fields;
        let mut lines = vec![format!("*{}* ({})", escape_markdown(&f.name), handle.kind)];

        if let Some(description) = &f.description {
            let (short, _) = truncate_chars(description, MAX_DESCRIPTION_CHARS);
            lines.push(escape_markdown(&short));
        }
        if !f.leaders.is_empty() {
            lines.push(format!("Leaders: {}", escape_list(&f.leaders)));
        }

        match handle.kind {
            EntityKind::Project => {
                if let Some(level) = &f.level {
                    lines.push(format!("Level: {}", escape_markdown(level)));
                }
                if let Some(stars) = f.stars {
                    lines.push(format!("Stars: {}", stars));
                }
            }
            EntityKind::Chapter => {
                let place: Vec<String> = [&f.location, &f.region]
                    .into_iter()
                    .flatten()
                    .map(|v| escape_markdown(v))
                    .collect();
                if !place.is_empty() {
                    lines.push(format!("Location: {}", place.join(", ")));
                }
                if let Some(group) = &f.meetup_group {
                    lines.push(format!("Meetup group: {}", escape_markdown(group)));
                }
            }
            EntityKind::Event => match (f.starts_at, f.ends_at) {
                (Some(start), Some(end)) if end != start => {
                    lines.push(format!("Dates: {} to {}", start, end))
                }
                (Some(start), _) => lines.push(format!("Date: {}", start)),
                _ => {}
            },
            EntityKind::Committee | EntityKind::Member => {}
        }

        if !f.urls.is_empty() {
            lines.push(format!("Links: {}", escape_list(&f.urls)));
        }
        if !f.tags.is_empty() {
            lines.push(format!("Tags: {}", escape_list(&f.tags)));
        }

        lines.join("\n")
    }
}

fn escape_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| escape_markdown(v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Candidate `(kind hint, key-or-name)` pairs in lookup order.
fn candidates(normalized: &str) -> Vec<(Option<EntityKind>, String)> {
    let toks = tokens(normalized);
    let mut out: Vec<(Option<EntityKind>, String)> = Vec::new();
    let mut push = |kind: Option<EntityKind>, words: &[&str]| {
        if words.is_empty() || words.iter().all(|w| STOPWORDS.contains(w)) {
            return;
        }
        for joined in [words.join("-"), words.join(" ")] {
            let pair = (kind, joined);
            if !out.contains(&pair) {
                out.push(pair);
            }
        }
    };

    if let Some(pos) = toks.iter().position(|t| EntityKind::from_mention(t).is_some()) {
        let kind = EntityKind::from_mention(toks[pos]);
        let after: Vec<&str> = toks[pos + 1..]
            .iter()
            .copied()
            .take_while(|t| !STOPWORDS.contains(t))
            .take(MAX_NGRAM)
            .collect();
        for n in (1..=after.len()).rev() {
            push(kind, &after[..n]);
        }
        let before: Vec<&str> = toks[..pos]
            .iter()
            .rev()
            .copied()
            .take_while(|t| !STOPWORDS.contains(t))
            .take(MAX_NGRAM)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        for n in (1..=before.len()).rev() {
            push(kind, &before[before.len() - n..]);
        }
    }

    let content: Vec<&str> = toks
        .iter()
        .copied()
        .filter(|t| !STOPWORDS.contains(t) && EntityKind::from_mention(t).is_none())
        .collect();
    for n in (1..=MAX_NGRAM.min(content.len())).rev() {
        for window in content.windows(n) {
            push(None, window);
        }
    }

    out.truncate(MAX_CANDIDATES);
    out
}
