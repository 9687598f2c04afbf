use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::time::timeout;
use tracing::debug;

use crate::{CacheBackend, CoordinationError, CoordinationResult, LeaseToken, LockService};

/// Deletes the key only when it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone, Debug)]
pub struct RedisPolicy {
    pub timeout: Duration,
}

impl Default for RedisPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

/// Redis-backed lock service and cache sharing one client and key prefix.
///
/// Locks live under `<prefix>:lock:<key>`, cache entries under `<prefix>:<key>`.
#[derive(Clone)]
pub struct RedisCoordinator {
    client: redis::Client,
    prefix: String,
    policy: RedisPolicy,
}

impl RedisCoordinator {
    pub fn new(url: &str, prefix: &str, policy: RedisPolicy) -> CoordinationResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches(':').to_string(),
            policy,
        })
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{key}", self.prefix)
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    async fn bounded<T, Fut>(&self, op: Fut) -> CoordinationResult<T>
    where
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        match timeout(self.policy.timeout, op).await {
            Ok(result) => result.map_err(CoordinationError::from),
            Err(_) => Err(CoordinationError::Timeout(self.policy.timeout)),
        }
    }

    async fn connection(&self) -> CoordinationResult<MultiplexedConnection> {
        self.bounded(self.client.get_multiplexed_async_connection())
            .await
    }
}

#[async_trait]
impl LockService for RedisCoordinator {
    async fn acquire(&self, key: &str, ttl: Duration) -> CoordinationResult<Option<LeaseToken>> {
        let key = self.lock_key(key);
        let token = LeaseToken::generate();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(token.as_str()).arg("NX").arg("PX").arg(ttl_ms);
        let reply: Option<String> = self.bounded(cmd.query_async(&mut conn)).await?;

        if reply.is_some() {
            debug!(key, ttl_ms, "lease acquired");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> CoordinationResult<bool> {
        let key = self.lock_key(key);
        let mut conn = self.connection().await?;
        let script = redis::Script::new(RELEASE_SCRIPT);
        let mut invocation = script.key(&key);
        invocation.arg(token.as_str());
        let deleted: i64 = self.bounded(invocation.invoke_async(&mut conn)).await?;
        debug!(key, released = deleted > 0, "lease release");
        Ok(deleted > 0)
    }
}

#[async_trait]
impl CacheBackend for RedisCoordinator {
    async fn get_raw(&self, key: &str) -> CoordinationResult<Option<String>> {
        let key = self.cache_key(key);
        let mut conn = self.connection().await?;
        self.bounded(conn.get(key)).await
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> CoordinationResult<()> {
        let key = self.cache_key(key);
        let ttl_secs = ttl.as_secs().max(1);
        let mut conn = self.connection().await?;
        self.bounded(conn.set_ex(key, value, ttl_secs)).await
    }

    async fn delete(&self, key: &str) -> CoordinationResult<()> {
        let key = self.cache_key(key);
        let mut conn = self.connection().await?;
        self.bounded(conn.del(key)).await
    }
}
