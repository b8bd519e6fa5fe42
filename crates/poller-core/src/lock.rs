//! Distributed lock port (§4.G) plus an in-process implementation for single-replica
//! deployments and this workspace's own tests. `poller-redis::RedisLock` is the production
//! implementation against real Redis.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::PollerError;

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Non-blocking acquire. `Ok(None)` means a peer already holds the lock, not an error
    /// (§7: lock contention is not an error).
    async fn try_acquire(self: Arc<Self>, key: &str, ttl: Duration) -> Result<Option<LockGuard>, PollerError>;

    /// Release `key` only if `token` is still the current owner. Expired/foreign locks are
    /// silently ignored, per §4.G.
    async fn release(&self, key: &str, token: &str);
}

/// Held while a distributed lock is owned. Drop spawns a best-effort release so a forgotten
/// guard doesn't hold the lock until TTL expiry; callers that care about release completing
/// before continuing should call [`LockGuard::release`] explicitly.
pub struct LockGuard {
    key: String,
    token: String,
    backend: Arc<dyn DistributedLock>,
    released: bool,
}

impl LockGuard {
    /// Built by `DistributedLock` implementations once they hold the lock.
    pub fn new(key: String, token: String, backend: Arc<dyn DistributedLock>) -> Self {
        Self {
            key,
            token,
            backend,
            released: false,
        }
    }

    pub async fn release(mut self) {
        self.backend.release(&self.key, &self.token).await;
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = self.backend.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            backend.release(&key, &token).await;
        });
    }
}

struct Entry {
    token: String,
    expires_at: Instant,
}

/// In-memory lock table, for `MemoryStore`-backed single-process deployments and tests.
#[derive(Default)]
pub struct InMemoryLock {
    table: Mutex<HashMap<String, Entry>>,
}

impl InMemoryLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(self: Arc<Self>, key: &str, ttl: Duration) -> Result<Option<LockGuard>, PollerError> {
        let mut table = self.table.lock().await;
        let now = Instant::now();
        if let Some(existing) = table.get(key) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        table.insert(
            key.to_string(),
            Entry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(LockGuard::new(key.to_string(), token, self)))
    }

    async fn release(&self, key: &str, token: &str) {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.get(key) {
            if entry.token == token {
                table.remove(key);
            }
        }
    }
}
