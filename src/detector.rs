//! Passive-mode question filter.
//!
//! A message counts as a question when it passes both tests:
//!
//! - **Syntactic**: ends with `?`, starts with or contains an interrogative
//!   word, or asks for help or advice.
//! - **Topical**: mentions a domain keyword, or (when enabled) the topic
//!   classifier says it is on-topic. Classifier errors count as "no".
//!
//! Only used when the bot was not addressed directly.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::config::DetectorConfig;
use crate::generator::{GenerationRequest, Generator};
use crate::models::{normalize, tokens};

const INTERROGATIVES: &[&str] = &[
    "what", "how", "why", "when", "where", "who", "whom", "whose", "which", "can", "could",
    "should", "would", "is", "are", "does", "do", "did", "will", "anyone", "anybody",
];

const HELP_CUES: &[&str] = &[
    "help",
    "explain",
    "recommend",
    "recommendation",
    "suggest",
    "suggestion",
    "advice",
    "advise",
    "guidance",
];

/// Second opinion on whether a message is about the foundation.
#[async_trait]
pub trait TopicClassifier: Send + Sync {
    async fn is_on_topic(&self, message: &str) -> Result<bool>;
}

const TOPIC_SYSTEM_PROMPT: &str = "You decide whether a chat message is a question about an open-source \
security foundation: its projects, chapters, committees, events, membership, or contributing. \
Answer with exactly one word: yes or no.";

/// [`TopicClassifier`] backed by the generator model.
pub struct ModelTopicClassifier {
    generator: Arc<dyn Generator>,
}

impl ModelTopicClassifier {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl TopicClassifier for ModelTopicClassifier {
    async fn is_on_topic(&self, message: &str) -> Result<bool> {
        let reply = self
            .generator
            .generate(&GenerationRequest {
                system: TOPIC_SYSTEM_PROMPT,
                context: None,
                user: message,
            })
            .await?;
        Ok(normalize(&reply).starts_with("yes"))
    }
}

pub struct QuestionDetector {
    keywords: Vec<String>,
    classifier: Option<Arc<dyn TopicClassifier>>,
}

impl QuestionDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            keywords: config.keywords.iter().map(|k| normalize(k)).collect(),
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TopicClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub async fn is_question(&self, message: &str) -> bool {
        let normalized = normalize(message);
        if !looks_like_question(&normalized) {
            return false;
        }
        if self.mentions_domain(&normalized) {
            return true;
        }
        match &self.classifier {
            Some(classifier) => match classifier.is_on_topic(message).await {
                Ok(on_topic) => on_topic,
                Err(e) => {
                    warn!(error = %e, "topic classifier failed; using keywords only");
                    false
                }
            },
            None => false,
        }
    }

    fn mentions_domain(&self, normalized: &str) -> bool {
        let toks = tokens(normalized);
        self.keywords.iter().any(|k| {
            toks.iter()
                .any(|t| *t == k.as_str() || t.strip_suffix('s') == Some(k.as_str()))
        })
    }
}

/// The syntactic half of the test.
pub fn looks_like_question(normalized: &str) -> bool {
    if normalized.ends_with('?') {
        return true;
    }
    let toks = tokens(normalized);
    toks.iter()
        .any(|t| INTERROGATIVES.contains(t) || HELP_CUES.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClassifier(Result<bool, ()>);

    #[async_trait]
    impl TopicClassifier for FixedClassifier {
        async fn is_on_topic(&self, _message: &str) -> Result<bool> {
            self.0.map_err(|_| anyhow::anyhow!("classifier offline"))
        }
    }

    fn detector() -> QuestionDetector {
        QuestionDetector::new(&DetectorConfig::default())
    }

    #[test]
    fn test_syntactic_check() {
        assert!(looks_like_question("is zap still maintained"));
        assert!(looks_like_question("need advice on threat modeling"));
        assert!(looks_like_question("zap?"));
        assert!(!looks_like_question("hello team"));
        assert!(!looks_like_question("shipped the release"));
    }

    #[tokio::test]
    async fn test_greeting_is_not_a_question() {
        assert!(!detector().is_question("hello team").await);
    }

    #[tokio::test]
    async fn test_on_topic_question() {
        assert!(detector().is_question("How do I start a chapter?").await);
        assert!(!detector().is_question("any upcoming events").await);
        assert!(detector().is_question("are there upcoming events?").await);
    }

    #[tokio::test]
    async fn test_off_topic_question_needs_classifier() {
        let msg = "what's for lunch?";
        assert!(!detector().is_question(msg).await);
        let yes = detector().with_classifier(Arc::new(FixedClassifier(Ok(true))));
        assert!(yes.is_question(msg).await);
    }

    #[tokio::test]
    async fn test_classifier_error_falls_back_to_keywords() {
        let broken = detector().with_classifier(Arc::new(FixedClassifier(Err(()))));
        assert!(!broken.is_question("what's for lunch?").await);
        assert!(broken.is_question("who leads the owasp chapter in Oslo?").await);
    }
}
