//! `DistributedLock` backed by Redis (§4.G), for deployments running more than one replica
//! of the poller. Acquire is `SET key token NX PX ttl_ms`; release is a compare-and-delete
//! Lua script so a replica can never drop a lock it doesn't own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use poller_core::error::PollerError;
use poller_core::lock::{DistributedLock, LockGuard};

/// Compare-and-delete: only remove the key if its value still matches the caller's token.
/// Prevents a replica from releasing a lock it no longer owns (e.g. after its own TTL
/// expired and a different replica took over).
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLock {
    conn: Mutex<MultiplexedConnection>,
}

impl RedisLock {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Arc<Self>> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Arc::new(Self { conn: Mutex::new(conn) }))
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(self: Arc<Self>, key: &str, ttl: Duration) -> Result<Option<LockGuard>, PollerError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.lock().await;
        let ok: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                warn!(error = %e, key, "redis error during lock acquire");
                PollerError::LockUnavailable { key: key.to_string() }
            })?;
        drop(conn);

        match ok {
            Some(_) => Ok(Some(LockGuard::new(key.to_string(), token, self))),
            None => Ok(None),
        }
    }

    async fn release(&self, key: &str, token: &str) {
        let mut conn = self.conn.lock().await;
        let result: redis::RedisResult<i64> = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut *conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, key, "failed to release redis lock, will expire via ttl");
        }
    }
}
