//! TOML configuration parsing and validation.
//!
//! All tunables of the question pipeline live in one file (default:
//! `config/askh.toml`). Every section except `[db]` and `[server]` is optional
//! and falls back to the defaults documented on each field.
//!
//! Secrets are never required in the file itself: the cache password falls
//! back to `ASKH_CACHE_PASSWORD` and the OpenAI-compatible providers read
//! `OPENAI_API_KEY`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::EntityKind;

/// Lower bound for cache socket/connect timeouts.
pub const MIN_CACHE_TIMEOUT_MS: u64 = 100;
/// Upper bound for cache socket/connect timeouts.
pub const MAX_CACHE_TIMEOUT_MS: u64 = 5_000;
/// Hard ceiling on pooled cache connections.
pub const MAX_CACHE_CONNECTIONS: usize = 10;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// `[cache]`: key/value backend used by the intent cache and rate limiter.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// `"redis"` (fleet-shared) or `"memory"` (single process).
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_cache_host")]
    pub host: String,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Development escape hatch: connect to redis without a password.
    #[serde(default)]
    pub allow_no_credentials: bool,
    /// Socket and connect timeout; clamped to `[100, 5000]` ms.
    #[serde(default = "default_cache_timeout_ms")]
    pub timeout_ms: u64,
    /// Pool size; clamped to `[1, 10]`.
    #[serde(default = "default_cache_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_intent_ttl_secs")]
    pub intent_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            host: default_cache_host(),
            port: default_cache_port(),
            username: None,
            password: None,
            allow_no_credentials: false,
            timeout_ms: default_cache_timeout_ms(),
            max_connections: default_cache_max_connections(),
            intent_ttl_secs: default_intent_ttl_secs(),
        }
    }
}

impl CacheConfig {
    /// The effective socket/connect timeout after clamping.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(
            self.timeout_ms
                .clamp(MIN_CACHE_TIMEOUT_MS, MAX_CACHE_TIMEOUT_MS),
        )
    }

    /// The effective pool size after clamping.
    pub fn pool_size(&self) -> usize {
        self.max_connections.clamp(1, MAX_CACHE_CONNECTIONS)
    }

    /// Password from config, falling back to `ASKH_CACHE_PASSWORD`.
    pub fn resolved_password(&self) -> Option<String> {
        self.password
            .clone()
            .or_else(|| std::env::var("ASKH_CACHE_PASSWORD").ok())
            .filter(|p| !p.is_empty())
    }
}

fn default_cache_backend() -> String {
    "redis".to_string()
}
fn default_cache_host() -> String {
    "127.0.0.1".to_string()
}
fn default_cache_port() -> u16 {
    6379
}
fn default_cache_timeout_ms() -> u64 {
    300
}
fn default_cache_max_connections() -> usize {
    MAX_CACHE_CONNECTIONS
}
fn default_intent_ttl_secs() -> u64 {
    3600
}

/// `[rate_limit]`: at most `max_requests` per `window_secs` per user.
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_max_requests() -> u32 {
    20
}
fn default_window_secs() -> u64 {
    60
}

/// `[router]`: intent classification.
#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// Deterministic cues that mark a query as STATIC.
    #[serde(default = "default_cues")]
    pub cues: Vec<String>,
    /// STATIC verdicts below this confidence are sent back for clarification.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Soft deadline for the whole routing step.
    #[serde(default = "default_router_deadline_ms")]
    pub deadline_ms: u64,
    /// Ask the generator model to classify queries with no heuristic cue.
    #[serde(default)]
    pub model_enabled: bool,
    /// Budget for the model stage, granted on top of `deadline_ms`.
    #[serde(default = "default_model_deadline_ms")]
    pub model_deadline_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cues: default_cues(),
            confidence_threshold: default_confidence_threshold(),
            deadline_ms: default_router_deadline_ms(),
            model_enabled: false,
            model_deadline_ms: default_model_deadline_ms(),
        }
    }
}

pub fn default_cues() -> Vec<String> {
    [
        "leader",
        "maintainer",
        "cve",
        "repo",
        "repository",
        "license",
        "version",
        "download",
        "link",
        "url",
        "website",
        "homepage",
        "contact",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_confidence_threshold() -> f64 {
    0.65
}
fn default_router_deadline_ms() -> u64 {
    50
}
fn default_model_deadline_ms() -> u64 {
    2000
}

/// `[detector]`: passive-mode question filter.
#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    /// Domain vocabulary for the topical test.
    #[serde(default = "default_domain_keywords")]
    pub keywords: Vec<String>,
    /// Ask the generator model when no domain keyword matches.
    #[serde(default)]
    pub classifier_enabled: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            keywords: default_domain_keywords(),
            classifier_enabled: false,
        }
    }
}

pub fn default_domain_keywords() -> Vec<String> {
    [
        "owasp",
        "project",
        "chapter",
        "committee",
        "event",
        "conference",
        "meetup",
        "member",
        "membership",
        "leader",
        "contributor",
        "contribute",
        "contribution",
        "security",
        "vulnerability",
        "appsec",
        "threat",
        "cve",
        "repo",
        "repository",
        "issue",
        "mentor",
        "mentorship",
        "gsoc",
        "sponsor",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"`, `"openai"`, `"ollama"`, or `"local"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks requested from the store.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Deadline for the whole retrieval + generation step.
    #[serde(default = "default_retrieval_deadline_secs")]
    pub deadline_secs: u64,
    /// Entity kinds searched by default; empty means all. Kinds named in the
    /// query are always added.
    #[serde(default)]
    pub kinds: Vec<EntityKind>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            deadline_secs: default_retrieval_deadline_secs(),
            kinds: Vec::new(),
        }
    }
}

fn default_k() -> usize {
    8
}
fn default_retrieval_deadline_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    /// `"disabled"` or `"openai"` (any OpenAI-compatible endpoint).
    #[serde(default = "default_generator_provider")]
    pub provider: String,
    #[serde(default = "default_generator_base_url")]
    pub base_url: String,
    #[serde(default = "default_generator_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
    /// Answers longer than this are cut and get a "more details" pointer.
    #[serde(default = "default_max_answer_chars")]
    pub max_answer_chars: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_generator_provider(),
            base_url: default_generator_base_url(),
            model: default_generator_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_generator_timeout_secs(),
            max_answer_chars: default_max_answer_chars(),
        }
    }
}

impl GeneratorConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_generator_provider() -> String {
    "disabled".to_string()
}
fn default_generator_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_generator_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.2
}
fn default_generator_timeout_secs() -> u64 {
    15
}
fn default_max_answer_chars() -> usize {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// `"production"` (generic user messages) or `"development"` (adds the reason).
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
        }
    }
}

impl PipelineConfig {
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

fn default_environment() -> String {
    "production".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check invariants that serde defaults cannot express.
///
/// Missing cache credentials are a startup failure unless
/// `cache.allow_no_credentials` is set.
pub fn validate(config: &Config) -> Result<()> {
    match config.cache.backend.as_str() {
        "redis" => {
            if config.cache.resolved_password().is_none() && !config.cache.allow_no_credentials {
                anyhow::bail!(
                    "cache.password (or ASKH_CACHE_PASSWORD) is required for the redis backend; \
                     set cache.allow_no_credentials = true for local development"
                );
            }
        }
        "memory" => {}
        other => anyhow::bail!(
            "Unknown cache backend: '{}'. Must be redis or memory.",
            other
        ),
    }

    if config.rate_limit.max_requests == 0 {
        anyhow::bail!("rate_limit.max_requests must be >= 1");
    }
    if config.rate_limit.window_secs == 0 {
        anyhow::bail!("rate_limit.window_secs must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.router.confidence_threshold) {
        anyhow::bail!("router.confidence_threshold must be in [0.0, 1.0]");
    }
    if config.router.cues.iter().any(|c| c.trim().is_empty()) {
        anyhow::bail!("router.cues must not contain empty entries");
    }
    if config.router.model_enabled && config.router.model_deadline_ms == 0 {
        anyhow::bail!("router.model_deadline_ms must be >= 1 when router.model_enabled = true");
    }

    if config.retrieval.k == 0 || config.retrieval.k > 50 {
        anyhow::bail!("retrieval.k must be in [1, 50]");
    }

    if config.embedding.is_enabled() && config.embedding.provider != "local" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    match config.generator.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generator provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.generator.max_answer_chars < 80 {
        anyhow::bail!("generator.max_answer_chars must be >= 80");
    }

    match config.pipeline.environment.as_str() {
        "production" | "development" => {}
        other => anyhow::bail!(
            "Unknown pipeline.environment: '{}'. Must be production or development.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let content = format!(
            r#"
[db]
path = "/tmp/askh.sqlite"

[server]
bind = "127.0.0.1:0"

{}
"#,
            extra
        );
        let config: Config = toml::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults_with_memory_cache() {
        let cfg = parse("[cache]\nbackend = \"memory\"").unwrap();
        assert_eq!(cfg.rate_limit.max_requests, 20);
        assert_eq!(cfg.rate_limit.window_secs, 60);
        assert_eq!(cfg.router.confidence_threshold, 0.65);
        assert_eq!(cfg.router.deadline_ms, 50);
        assert_eq!(cfg.router.model_deadline_ms, 2000);
        assert_eq!(cfg.cache.intent_ttl_secs, 3600);
        assert_eq!(cfg.retrieval.k, 8);
        assert!(cfg.router.cues.iter().any(|c| c == "maintainer"));
    }

    #[test]
    fn test_redis_requires_credentials() {
        let err = parse("[cache]\nbackend = \"redis\"\npassword = \"\"").unwrap_err();
        assert!(err.to_string().contains("allow_no_credentials"));
    }

    #[test]
    fn test_redis_opt_out_of_credentials() {
        let cfg = parse("[cache]\nallow_no_credentials = true").unwrap();
        assert_eq!(cfg.cache.backend, "redis");
    }

    #[test]
    fn test_cache_timeout_is_clamped() {
        let mut cache = CacheConfig {
            timeout_ms: 5,
            ..CacheConfig::default()
        };
        assert_eq!(cache.timeout(), Duration::from_millis(100));
        cache.timeout_ms = 60_000;
        assert_eq!(cache.timeout(), Duration::from_secs(5));
        cache.timeout_ms = 300;
        assert_eq!(cache.timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_pool_size_is_capped() {
        let cache = CacheConfig {
            max_connections: 64,
            ..CacheConfig::default()
        };
        assert_eq!(cache.pool_size(), 10);
    }

    #[test]
    fn test_retrieval_kinds() {
        let cfg = parse("[cache]\nbackend = \"memory\"\n[retrieval]\nkinds = [\"project\", \"event\"]")
            .unwrap();
        assert_eq!(cfg.retrieval.kinds, vec![EntityKind::Project, EntityKind::Event]);
        assert!(parse("[cache]\nbackend = \"memory\"\n[retrieval]\nkinds = [\"planet\"]").is_err());
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let err = parse("[cache]\nbackend = \"memory\"\n[router]\nconfidence_threshold = 1.5")
            .unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));
    }

    #[test]
    fn test_model_stage_needs_a_budget() {
        let err = parse(
            "[cache]\nbackend = \"memory\"\n[router]\nmodel_enabled = true\nmodel_deadline_ms = 0",
        )
        .unwrap_err();
        assert!(err.to_string().contains("model_deadline_ms"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse("[cache]\nbackend = \"memory\"\n[embedding]\nprovider = \"magic\"")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/askh.toml");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.cache.backend, "memory");
        assert!(cfg.pipeline.is_development());
    }

    #[test]
    fn test_embedding_requires_model_and_dims() {
        let err = parse("[cache]\nbackend = \"memory\"\n[embedding]\nprovider = \"openai\"")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }
}
