//! Per-user request throttling.
//!
//! Each user gets a counter at `rate_limit:<user_id>` that is incremented
//! atomically by [`CacheScript::IncrementWithExpiry`]; the first increment in
//! a window sets the key's expiry to `window_secs`. A request is admitted
//! while the post-increment count is at most `max_requests`.
//!
//! Because the increment and the expiry happen in one server-side script,
//! concurrent requests from the same user across the fleet cannot
//! over-admit. If the cache is unavailable the limiter admits the request:
//! throttling must never take the assistant down.

use tracing::debug;

use crate::cache::{CacheClient, CacheScript};
use crate::config::RateLimitConfig;

pub const RATE_LIMIT_PREFIX: &str = "rate_limit:";

#[derive(Clone)]
pub struct RateLimiter {
    cache: CacheClient,
    max_requests: u32,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(cache: CacheClient, config: &RateLimitConfig) -> Self {
        Self {
            cache,
            max_requests: config.max_requests,
            window_secs: config.window_secs,
        }
    }

    pub fn key(user_id: &str) -> String {
        format!("{}{}", RATE_LIMIT_PREFIX, user_id)
    }

    /// Count this request and report whether it is within the limit.
    pub async fn is_allowed(&self, user_id: &str) -> bool {
        let keys = [Self::key(user_id)];
        let args = [self.window_secs.to_string()];
        match self
            .cache
            .eval_script(CacheScript::IncrementWithExpiry, &keys, &args)
            .await
        {
            Some(count) => {
                let allowed = count <= i64::from(self.max_requests);
                if !allowed {
                    debug!(user_id, count, limit = self.max_requests, "rate limit exceeded");
                }
                allowed
            }
            None => true,
        }
    }
}
