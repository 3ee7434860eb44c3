//! Redis-backed [`CacheBackend`] with a small bounded connection pool.
//!
//! # Pool
//!
//! At most `cache.max_connections` (≤ 10) multiplexed connections exist at a
//! time. A semaphore bounds concurrent checkouts; idle connections are kept
//! on a stack and reused. A connection that errors or times out is dropped
//! instead of being returned to the stack.
//!
//! # Timeouts
//!
//! Permit acquisition, connect, and every command share one clamped timeout
//! (`cache.timeout_ms`, default 300 ms). Hitting it is an ordinary error,
//! which [`CacheClient`](super::CacheClient) turns into a fail-open result.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, IntoConnectionInfo};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout;

use super::{CacheBackend, CacheScript};
use crate::config::CacheConfig;

pub struct RedisBackend {
    client: redis::Client,
    timeout: Duration,
    permits: Semaphore,
    idle: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisBackend {
    /// Prepare a client for `host:port`. No connection is opened until the
    /// first command.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let mut info = (config.host.as_str(), config.port)
            .into_connection_info()
            .with_context(|| format!("invalid cache address {}:{}", config.host, config.port))?;
        info.redis.username = config.username.clone();
        info.redis.password = config.resolved_password();

        let client = redis::Client::open(info).context("Failed to create redis client")?;

        Ok(Self {
            client,
            timeout: config.timeout(),
            permits: Semaphore::new(config.pool_size()),
            idle: Mutex::new(Vec::new()),
        })
    }

    async fn checkout(&self) -> Result<(SemaphorePermit<'_>, MultiplexedConnection)> {
        let permit = timeout(self.timeout, self.permits.acquire())
            .await
            .map_err(|_| anyhow!("cache pool saturated"))?
            .map_err(|_| anyhow!("cache pool closed"))?;

        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        if let Some(conn) = reused {
            return Ok((permit, conn));
        }

        let conn = timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| anyhow!("cache connect timed out after {:?}", self.timeout))?
            .context("cache connect failed")?;
        Ok((permit, conn))
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let (_permit, mut conn) = self.checkout().await?;
        let reply: redis::RedisResult<T> = timeout(self.timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| anyhow!("cache command timed out after {:?}", self.timeout))?;
        let value = reply?;
        self.checkin(conn);
        Ok(value)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let secs = ttl.as_secs().max(1);
        self.query::<()>(redis::cmd("SET").arg(key).arg(value).arg("EX").arg(secs))
            .await
    }

    async fn eval_script(
        &self,
        script: CacheScript,
        keys: &[String],
        args: &[String],
    ) -> Result<i64> {
        let lua = redis::Script::new(script.lua());
        let mut invocation = lua.prepare_invoke();
        for k in keys {
            invocation.key(k);
        }
        for a in args {
            invocation.arg(a);
        }

        let (_permit, mut conn) = self.checkout().await?;
        let reply: redis::RedisResult<i64> =
            timeout(self.timeout, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| anyhow!("{} timed out after {:?}", script.name(), self.timeout))?;
        let count = reply?;
        self.checkin(conn);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_does_not_connect() {
        let config = CacheConfig {
            host: "203.0.113.1".to_string(),
            password: Some("secret".to_string()),
            ..CacheConfig::default()
        };
        let backend = RedisBackend::new(&config).unwrap();
        assert_eq!(backend.permits.available_permits(), 10);
        assert_eq!(backend.timeout, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_unreachable_server_errors_within_timeout() {
        let config = CacheConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            allow_no_credentials: true,
            timeout_ms: 100,
            ..CacheConfig::default()
        };
        let backend = RedisBackend::new(&config).unwrap();
        let started = std::time::Instant::now();
        assert!(backend.get("k").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
