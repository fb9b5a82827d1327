use async_trait::async_trait;
use chrono::Utc;
use gate_core::{retry, GateError, PermissionCacheEntry, PermissionOrigin, Result, RetryPolicy};
use metrics::increment_counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, warn};

/// 跨实例共享的权限缓存（二级缓存）
#[async_trait]
pub trait SharedPermissionCache: Send + Sync {
    async fn get(&self, user_id: &str, permission_code: &str) -> Result<Option<bool>>;

    async fn put(&self, user_id: &str, permission_code: &str, granted: bool, ttl: Duration) -> Result<()>;
}

/// 进程内共享缓存实现（测试与单实例部署）
pub struct MemorySharedPermissionCache {
    entries: RwLock<HashMap<String, (bool, tokio::time::Instant)>>,
    available: AtomicBool,
}

impl MemorySharedPermissionCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// 模拟共享缓存不可达
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GateError::Store("shared permission cache unavailable".to_string()))
        }
    }
}

impl Default for MemorySharedPermissionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedPermissionCache for MemorySharedPermissionCache {
    async fn get(&self, user_id: &str, permission_code: &str) -> Result<Option<bool>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(&PermissionCacheEntry::cache_key(user_id, permission_code))
            .filter(|(_, expires_at)| *expires_at > tokio::time::Instant::now())
            .map(|(granted, _)| *granted))
    }

    async fn put(&self, user_id: &str, permission_code: &str, granted: bool, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        entries.insert(
            PermissionCacheEntry::cache_key(user_id, permission_code),
            (granted, tokio::time::Instant::now() + ttl),
        );
        Ok(())
    }
}

/// Redis 共享缓存：`{prefix}:authz:perm:{user}:{code}` -> "1" / "0"
#[cfg(feature = "redis-store")]
pub struct RedisSharedPermissionCache {
    client: redis::Client,
    key_prefix: String,
}

#[cfg(feature = "redis-store")]
impl RedisSharedPermissionCache {
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| GateError::Config(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, user_id: &str, permission_code: &str) -> String {
        format!("{}:authz:perm:{}:{}", self.key_prefix, user_id, permission_code)
    }
}

#[cfg(feature = "redis-store")]
#[async_trait]
impl SharedPermissionCache for RedisSharedPermissionCache {
    async fn get(&self, user_id: &str, permission_code: &str) -> Result<Option<bool>> {
        use redis::AsyncCommands;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GateError::Store(e.to_string()))?;
        let value: Option<String> = conn
            .get(self.key(user_id, permission_code))
            .await
            .map_err(|e| GateError::Store(e.to_string()))?;
        Ok(value.map(|v| v == "1"))
    }

    async fn put(&self, user_id: &str, permission_code: &str, granted: bool, ttl: Duration) -> Result<()> {
        use redis::AsyncCommands;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GateError::Store(e.to_string()))?;
        conn.set_ex::<_, _, ()>(
            self.key(user_id, permission_code),
            if granted { "1" } else { "0" },
            ttl.as_secs().max(1),
        )
        .await
        .map_err(|e| GateError::Store(e.to_string()))
    }
}

/// 一级缓存：进程内、有上限
struct LocalPermissionCache {
    entries: Mutex<HashMap<String, PermissionCacheEntry>>,
    max_entries: usize,
}

impl LocalPermissionCache {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| entry.is_fresh(Utc::now()))
            .map(|entry| entry.granted)
    }

    fn insert(&self, key: String, entry: PermissionCacheEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let now = Utc::now();
            entries.retain(|_, e| e.is_fresh(now));
            // 仍然满：丢弃最早过期的一条
            if entries.len() >= self.max_entries {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key, entry);
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

type Flight = Arc<OnceCell<Result<bool>>>;

/// 多级权限缓存：本地 -> 共享 -> 权威源
///
/// 同一 (user, permission) 的并发未命中只会产生一次权威源调用。
pub struct PermissionCache {
    local: LocalPermissionCache,
    shared: Option<Arc<dyn SharedPermissionCache>>,
    origin: Arc<dyn PermissionOrigin>,
    inflight: Mutex<HashMap<String, Flight>>,
    local_ttl: Duration,
    shared_ttl: Duration,
    retry: RetryPolicy,
}

impl PermissionCache {
    pub fn new(origin: Arc<dyn PermissionOrigin>, shared: Option<Arc<dyn SharedPermissionCache>>) -> Self {
        Self {
            local: LocalPermissionCache::new(100_000),
            shared,
            origin,
            inflight: Mutex::new(HashMap::new()),
            local_ttl: Duration::from_secs(60),
            shared_ttl: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_ttls(mut self, local_ttl: Duration, shared_ttl: Duration) -> Self {
        self.local_ttl = local_ttl;
        self.shared_ttl = shared_ttl;
        self
    }

    pub fn with_local_capacity(mut self, max_entries: usize) -> Self {
        self.local = LocalPermissionCache::new(max_entries);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// 用户是否持有权限
    ///
    /// 权威源不可达且两级缓存都未命中时返回 `Forbidden`。
    pub async fn has_permission(&self, user_id: &str, permission_code: &str) -> Result<bool> {
        let key = PermissionCacheEntry::cache_key(user_id, permission_code);

        if let Some(granted) = self.local.get(&key) {
            increment_counter!("gate_permission_lookups_total", "level" => "local");
            return Ok(granted);
        }

        let flight = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.entry(key.clone()).or_default().clone()
        };

        let result = flight
            .get_or_init(|| self.load_through(&key, user_id, permission_code))
            .await
            .clone();

        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if inflight.get(&key).is_some_and(|current| Arc::ptr_eq(current, &flight)) {
                inflight.remove(&key);
            }
        }

        result
    }

    async fn load_through(&self, key: &str, user_id: &str, permission_code: &str) -> Result<bool> {
        // 排队期间上一轮可能已经写入本地缓存
        if let Some(granted) = self.local.get(key) {
            increment_counter!("gate_permission_lookups_total", "level" => "local");
            return Ok(granted);
        }

        if let Some(shared) = &self.shared {
            match shared.get(user_id, permission_code).await {
                Ok(Some(granted)) => {
                    increment_counter!("gate_permission_lookups_total", "level" => "shared");
                    self.store_local(key, user_id, permission_code, granted);
                    return Ok(granted);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Shared permission cache unavailable, falling through to origin"),
            }
        }

        increment_counter!("gate_permission_lookups_total", "level" => "origin");
        increment_counter!("gate_permission_origin_calls_total");

        let origin = &self.origin;
        let granted = match retry(&self.retry, "permission.origin", move || {
            origin.has_permission(user_id, permission_code)
        })
        .await
        {
            Ok(granted) => granted,
            Err(e) => {
                error!(
                    user_id,
                    permission_code,
                    error = %e,
                    "Permission origin failed, denying"
                );
                return Err(GateError::Forbidden("permission could not be verified".to_string()));
            }
        };

        if let Some(shared) = &self.shared {
            if let Err(e) = shared.put(user_id, permission_code, granted, self.shared_ttl).await {
                warn!(error = %e, "Failed to write shared permission cache");
            }
        }
        self.store_local(key, user_id, permission_code, granted);

        debug!(user_id, permission_code, granted, "Permission resolved from origin");
        Ok(granted)
    }

    fn store_local(&self, key: &str, user_id: &str, permission_code: &str, granted: bool) {
        let ttl = chrono::Duration::from_std(self.local_ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let entry = PermissionCacheEntry::new(user_id, permission_code, granted, ttl, Utc::now());
        self.local.insert(key.to_string(), entry);
    }
}
