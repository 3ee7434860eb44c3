//! In-process [`CacheBackend`] for tests and single-node development.
//!
//! Entries live in a `HashMap` behind a `std::sync::Mutex`. Expiry uses
//! `tokio::time::Instant`, so tests can drive TTLs with a paused clock.
//! Expired entries are dropped on access, and every [`SWEEP_EVERY`] writes
//! the whole map is swept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheBackend, CacheScript};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

/// Writes between full sweeps of expired entries.
pub const SWEEP_EVERY: usize = 256;

type Entries = HashMap<String, Entry>;

pub struct MemoryBackend {
    entries: Mutex<Entries>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|m| m.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("memory cache lock poisoned"))
    }

    /// Insert under an already-held lock, sweeping expired keys when due.
    fn insert(&self, entries: &mut Entries, key: String, entry: Entry, now: Instant) {
        entries.insert(key, entry);
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            entries.retain(|_, e| e.is_live(now));
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        self.insert(
            &mut entries,
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
            now,
        );
        Ok(())
    }

    async fn eval_script(
        &self,
        script: CacheScript,
        keys: &[String],
        args: &[String],
    ) -> Result<i64> {
        match script {
            CacheScript::IncrementWithExpiry => {
                let key = keys
                    .first()
                    .ok_or_else(|| anyhow!("{} needs one key", script.name()))?;
                let ttl_secs: u64 = args
                    .first()
                    .ok_or_else(|| anyhow!("{} needs a ttl argument", script.name()))?
                    .parse()?;

                let now = Instant::now();
                let mut entries = self.lock()?;
                let current = match entries.get(key) {
                    Some(e) if e.is_live(now) => match e.value.parse::<i64>() {
                        Ok(n) => Some((n, e.expires_at)),
                        Err(_) => bail!("value at {} is not an integer", key),
                    },
                    _ => None,
                };

                let (count, expires_at) = match current {
                    Some((n, expires_at)) => (n + 1, expires_at),
                    None => (1, Some(now + Duration::from_secs(ttl_secs))),
                };
                self.insert(
                    &mut entries,
                    key.clone(),
                    Entry {
                        value: count.to_string(),
                        expires_at,
                    },
                    now,
                );
                Ok(count)
            }
        }
    }
}
