//! Fail-open key/value cache used by the intent router and rate limiter.
//!
//! The [`CacheBackend`] trait is the raw, fallible interface; two backends
//! implement it:
//!
//! | Backend | Module | Scope |
//! |---------|--------|-------|
//! | Redis | [`redis_backend`] | Shared across the fleet; bounded connection pool |
//! | Memory | [`memory`] | Single process; tests and local development |
//!
//! [`CacheClient`] wraps a backend and never surfaces operational errors:
//! reads fail as misses, writes fail silently, and script evaluations fail
//! as `None` so callers can choose their own permissive default. Each failure
//! is logged once at `warn`.

pub mod memory;
pub mod redis_backend;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::config::CacheConfig;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

/// Server-side scripts the cache can evaluate atomically.
///
/// Scripts form a closed set so every backend can honour the same
/// semantics: Redis runs the Lua source, the memory backend runs an
/// equivalent under its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScript {
    /// `INCR KEYS[1]`; when the result is 1, `EXPIRE KEYS[1] ARGV[1]`.
    /// Returns the post-increment count.
    IncrementWithExpiry,
}

impl CacheScript {
    pub fn name(&self) -> &'static str {
        match self {
            CacheScript::IncrementWithExpiry => "increment_with_expiry",
        }
    }

    pub fn lua(&self) -> &'static str {
        match self {
            CacheScript::IncrementWithExpiry => {
                r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#
            }
        }
    }
}

/// Raw, fallible cache operations.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend identifier for logs (`"redis"`, `"memory"`).
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn eval_script(&self, script: CacheScript, keys: &[String], args: &[String])
        -> Result<i64>;
}

/// Process-wide client; initialised once by the first caller of [`CacheClient::shared`].
static SHARED: OnceCell<CacheClient> = OnceCell::const_new();

/// Fail-open facade over a [`CacheBackend`].
#[derive(Clone)]
pub struct CacheClient {
    backend: Arc<dyn CacheBackend>,
}

impl CacheClient {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Build a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Fails on misconfiguration only: an unknown backend name, or a redis
    /// backend without credentials when `allow_no_credentials` is off.
    /// Nothing here touches the network.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        match config.backend.as_str() {
            "redis" => {
                if config.resolved_password().is_none() && !config.allow_no_credentials {
                    bail!("redis cache requires credentials (cache.password or ASKH_CACHE_PASSWORD)");
                }
                Ok(Self::new(Arc::new(RedisBackend::new(config)?)))
            }
            "memory" => Ok(Self::new(Arc::new(MemoryBackend::new()))),
            other => bail!("Unknown cache backend: {}", other),
        }
    }

    /// The process-wide client. Concurrent first calls race on a single-winner
    /// guard; later calls return the same pool regardless of `config`.
    pub async fn shared(config: &CacheConfig) -> Result<Self> {
        SHARED
            .get_or_try_init(|| async { Self::from_config(config) })
            .await
            .cloned()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Read a key; any backend error is reported as a miss.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.backend.get(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(backend = self.backend.name(), key, error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Write a key with a TTL; any backend error is swallowed.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.backend.set(key, value, ttl).await {
            warn!(backend = self.backend.name(), key, error = %e, "cache write failed; ignoring");
        }
    }

    /// Evaluate a script; any backend error yields `None`.
    pub async fn eval_script(
        &self,
        script: CacheScript,
        keys: &[String],
        args: &[String],
    ) -> Option<i64> {
        match self.backend.eval_script(script, keys, args).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    script = script.name(),
                    error = %e,
                    "cache script failed"
                );
                None
            }
        }
    }
}
