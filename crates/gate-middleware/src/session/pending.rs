use async_trait::async_trait;
use gate_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[cfg(feature = "redis-store")]
use gate_core::GateError;

/// 登录重定向期间暂存 `state -> code_verifier`
#[async_trait]
pub trait PendingLoginStore: Send + Sync {
    async fn put(&self, state: &str, code_verifier: &str, ttl: Duration) -> Result<()>;

    /// 取出并删除；每个 state 只能被消费一次
    async fn take(&self, state: &str) -> Result<Option<String>>;
}

/// 内存实现
pub struct MemoryPendingLoginStore {
    entries: Arc<RwLock<HashMap<String, (String, Instant)>>>,
}

impl MemoryPendingLoginStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryPendingLoginStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PendingLoginStore for MemoryPendingLoginStore {
    async fn put(&self, state: &str, code_verifier: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(state.to_string(), (code_verifier.to_string(), now + ttl));
        Ok(())
    }

    async fn take(&self, state: &str) -> Result<Option<String>> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(state)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(verifier, _)| verifier))
    }
}

#[cfg(feature = "redis-store")]
pub struct RedisPendingLoginStore {
    client: redis::Client,
    key_prefix: String,
}

#[cfg(feature = "redis-store")]
impl RedisPendingLoginStore {
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| GateError::Config(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, state: &str) -> String {
        format!("{}:pkce:{}", self.key_prefix, state)
    }
}

#[cfg(feature = "redis-store")]
#[async_trait]
impl PendingLoginStore for RedisPendingLoginStore {
    async fn put(&self, state: &str, code_verifier: &str, ttl: Duration) -> Result<()> {
        use redis::AsyncCommands;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GateError::Store(e.to_string()))?;
        conn.set_ex::<_, _, ()>(self.key(state), code_verifier, ttl.as_secs().max(1))
            .await
            .map_err(|e| GateError::Store(e.to_string()))
    }

    async fn take(&self, state: &str) -> Result<Option<String>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GateError::Store(e.to_string()))?;
        redis::cmd("GETDEL")
            .arg(self.key(state))
            .query_async(&mut conn)
            .await
            .map_err(|e| GateError::Store(e.to_string()))
    }
}
