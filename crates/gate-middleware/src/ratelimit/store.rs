use async_trait::async_trait;
use gate_core::{GateError, RateLimitBucket, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::strategy::BucketParams;
use super::token_bucket::TakeOutcome;

/// 所有网关实例共享的令牌桶计数存储
///
/// `take` 必须是单键原子的 refill + 取令牌。
#[async_trait]
pub trait SharedBucketStore: Send + Sync {
    async fn take(&self, key: &str, params: &BucketParams, now_ms: i64) -> Result<TakeOutcome>;
}

/// 进程内共享存储（测试与单节点部署），可模拟不可达
pub struct MemoryBucketStore {
    buckets: Mutex<HashMap<String, RateLimitBucket>>,
    available: AtomicBool,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GateError::UpstreamUnavailable("rate-limit store unreachable".to_string()))
        }
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedBucketStore for MemoryBucketStore {
    async fn take(&self, key: &str, params: &BucketParams, now_ms: i64) -> Result<TakeOutcome> {
        self.check_available()?;

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| RateLimitBucket::new(key, params.capacity, now_ms));
        bucket.capacity = params.capacity;

        let allowed = bucket.try_take(now_ms, params.refill_per_sec);
        Ok(TakeOutcome::from_tokens(allowed, bucket.tokens, params.refill_per_sec))
    }
}

/// Redis 存储：每个客户端一个 hash `{prefix}:ratelimit:{key}`，字段 tokens / ts
#[cfg(feature = "redis-store")]
pub struct RedisBucketStore {
    client: redis::Client,
    key_prefix: String,
}

// 时间取 Redis 服务器时钟，各实例之间不受本地时钟偏差影响
#[cfg(feature = "redis-store")]
const TAKE_SCRIPT: &str = r"
local capacity = tonumber(ARGV[1])
local rate_per_ms = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end
if now > ts then
    tokens = math.min(capacity, tokens + (now - ts) * rate_per_ms)
    ts = now
end
if tokens > capacity then
    tokens = capacity
end

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', ts)
redis.call('PEXPIRE', KEYS[1], ttl_ms)
return {allowed, tostring(tokens)}
";

#[cfg(feature = "redis-store")]
impl RedisBucketStore {
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| GateError::Config(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GateError::UpstreamUnavailable(format!("redis: {}", e)))
    }
}

#[cfg(feature = "redis-store")]
#[async_trait]
impl SharedBucketStore for RedisBucketStore {
    async fn take(&self, key: &str, params: &BucketParams, _now_ms: i64) -> Result<TakeOutcome> {
        let mut conn = self.connection().await?;

        let (allowed, tokens): (i64, String) = redis::Script::new(TAKE_SCRIPT)
            .key(format!("{}:ratelimit:{}", self.key_prefix, key))
            .arg(params.capacity)
            .arg(params.refill_per_sec / 1000.0)
            .arg(params.idle_ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GateError::UpstreamUnavailable(format!("redis: {}", e)))?;

        let tokens: f64 = tokens
            .parse()
            .map_err(|_| GateError::Store(format!("unexpected token count: {}", tokens)))?;
        Ok(TakeOutcome::from_tokens(allowed == 1, tokens, params.refill_per_sec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params(capacity: u64) -> BucketParams {
        BucketParams {
            capacity,
            refill_per_sec: capacity as f64 / 60.0,
            idle_ttl: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn test_memory_store_take() {
        let store = MemoryBucketStore::new();
        let params = params(3);

        for expected_remaining in [2, 1, 0] {
            let outcome = store.take("ip:1", &params, 0).await.unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.remaining, expected_remaining);
        }

        let rejected = store.take("ip:1", &params, 0).await.unwrap();
        assert!(!rejected.allowed);
        // 3 / 60 个每秒 -> 20 秒一个
        assert_eq!(rejected.retry_after_secs, 20);

        // 其他键互不影响
        assert!(store.take("ip:2", &params, 0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_memory_store_outage() {
        let store = MemoryBucketStore::new();
        store.set_available(false);

        let err = store.take("ip:1", &params(3), 0).await.unwrap_err();
        assert!(err.is_retryable());

        store.set_available(true);
        assert!(store.take("ip:1", &params(3), 0).await.unwrap().allowed);
    }
}
