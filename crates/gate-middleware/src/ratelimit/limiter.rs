use chrono::Utc;
use gate_core::{retry, RetryPolicy};
use metrics::increment_counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::SharedBucketStore;
use super::strategy::{ClientKey, RateLimitTier, TierLimits};
use super::token_bucket::{TakeOutcome, TokenBucket};

/// 做出限流判定的后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterBackend {
    Shared,
    Local,
}

impl LimiterBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterBackend::Shared => "shared",
            LimiterBackend::Local => "local",
        }
    }
}

/// 限流判定
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub client_key: String,
    pub tier: RateLimitTier,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after_secs: u64,
    pub backend: LimiterBackend,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// 分布式令牌桶限流器
///
/// 正常情况下所有实例共用共享存储中的同一个桶；共享存储不可达时
/// 退化为本实例内的本地桶，并按 `probe_interval` 探测恢复。
pub struct RateLimiter {
    limits: TierLimits,
    shared: Option<Arc<dyn SharedBucketStore>>,
    local: RwLock<HashMap<String, Arc<TokenBucket>>>,
    degraded: AtomicBool,
    last_probe_ms: AtomicI64,
    probe_interval: Duration,
    retry: RetryPolicy,
    local_idle_ttl: Duration,
}

impl RateLimiter {
    /// 创建新的限流器；`shared` 为 `None` 时只使用本地桶
    pub fn new(limits: TierLimits, shared: Option<Arc<dyn SharedBucketStore>>) -> Self {
        Self {
            limits,
            shared,
            local: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            last_probe_ms: AtomicI64::new(0),
            probe_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            local_idle_ttl: Duration::from_secs(300),
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_local_idle_ttl(mut self, ttl: Duration) -> Self {
        self.local_idle_ttl = ttl;
        self
    }

    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    /// 当前是否处于本地降级模式
    pub fn is_degraded(&self) -> bool {
        self.shared.is_none() || self.degraded.load(Ordering::SeqCst)
    }

    /// 检查是否允许请求
    pub async fn check(&self, key: &ClientKey) -> RateLimitDecision {
        self.check_at(key, now_ms()).await
    }

    pub async fn check_at(&self, key: &ClientKey, now_ms: i64) -> RateLimitDecision {
        let params = self.limits.params(key.tier());

        if let Some(shared) = &self.shared {
            if let Some(probe) = self.shared_attempt(now_ms) {
                let policy = if probe { RetryPolicy::none() } else { self.retry };
                let client_key = key.as_str();
                let params_ref = &params;

                match retry(&policy, "ratelimit.take", move || shared.take(client_key, params_ref, now_ms)).await {
                    Ok(outcome) => {
                        if self.degraded.swap(false, Ordering::SeqCst) {
                            info!("Shared rate-limit store recovered, leaving local fallback");
                        }
                        return self.decision(key, params.capacity, outcome, LimiterBackend::Shared);
                    }
                    Err(e) => {
                        self.last_probe_ms.store(now_ms, Ordering::SeqCst);
                        if !self.degraded.swap(true, Ordering::SeqCst) {
                            warn!(error = %e, "Shared rate-limit store unavailable, falling back to local buckets");
                        } else {
                            debug!(error = %e, "Shared rate-limit store probe failed");
                        }
                    }
                }
            }
        }

        let bucket = self.local_bucket(key.as_str(), params.capacity, params.refill_per_sec, now_ms).await;
        let outcome = bucket.try_acquire(now_ms).await;
        self.decision(key, params.capacity, outcome, LimiterBackend::Local)
    }

    /// `None`：本次直接用本地桶；`Some(true)`：降级期间的探测请求
    fn shared_attempt(&self, now_ms: i64) -> Option<bool> {
        if !self.degraded.load(Ordering::SeqCst) {
            return Some(false);
        }

        let last = self.last_probe_ms.load(Ordering::SeqCst);
        if now_ms.saturating_sub(last) < self.probe_interval.as_millis() as i64 {
            return None;
        }
        // 同一时刻只放一个请求去探测
        self.last_probe_ms
            .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| true)
    }

    async fn local_bucket(&self, key: &str, capacity: u64, refill_per_sec: f64, now_ms: i64) -> Arc<TokenBucket> {
        if let Some(bucket) = self.local.read().await.get(key) {
            return bucket.clone();
        }

        let mut buckets = self.local.write().await;
        buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(key, capacity, refill_per_sec, now_ms)))
            .clone()
    }

    fn decision(&self, key: &ClientKey, limit: u64, outcome: TakeOutcome, backend: LimiterBackend) -> RateLimitDecision {
        increment_counter!(
            "gate_ratelimit_decisions_total",
            "backend" => backend.as_str(),
            "result" => if outcome.allowed { "allowed" } else { "rejected" }
        );
        if !outcome.allowed {
            debug!(key = %key.as_str(), backend = backend.as_str(), "Rate limit exceeded");
        }

        RateLimitDecision {
            allowed: outcome.allowed,
            client_key: key.as_str().to_string(),
            tier: key.tier(),
            limit,
            remaining: outcome.remaining,
            retry_after_secs: outcome.retry_after_secs,
            backend,
        }
    }

    /// 清理长时间未使用的本地桶
    pub async fn cleanup_idle(&self, now_ms: i64) -> usize {
        let idle_ms = self.local_idle_ttl.as_millis() as i64;
        let mut buckets = self.local.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| now_ms.saturating_sub(bucket.last_used_ms()) < idle_ms);
        before - buckets.len()
    }

    pub async fn local_bucket_count(&self) -> usize {
        self.local.read().await.len()
    }

    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup_idle(now_ms()).await;
                if removed > 0 {
                    debug!(removed, "Removed idle local rate-limit buckets");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryBucketStore;

    fn limiter_with_store(store: Arc<MemoryBucketStore>) -> RateLimiter {
        RateLimiter::new(TierLimits::default(), Some(store))
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)))
            .with_probe_interval(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_101st_request_rejected() {
        let store = Arc::new(MemoryBucketStore::new());
        let limiter = limiter_with_store(store);
        let key = ClientKey::by_ip("192.168.1.1");

        for i in 0..100 {
            let decision = limiter.check_at(&key, 1_000).await;
            assert!(decision.allowed, "Request {} should pass", i);
            assert_eq!(decision.backend, LimiterBackend::Shared);
        }

        let rejected = limiter.check_at(&key, 1_000).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.limit, 100);
        assert_eq!(rejected.remaining, 0);
        // 100 / 60s -> 0.6 秒补一个，向上取整为 1
        assert_eq!(rejected.retry_after_secs, 1);

        // 补充之后再次放行
        assert!(limiter.check_at(&key, 1_700).await.allowed);
    }

    #[tokio::test]
    async fn test_tiers_have_separate_budgets() {
        let limiter = RateLimiter::new(TierLimits::new(1, 2, 3, Duration::from_secs(60)), None);

        let anonymous = ClientKey::by_ip("10.0.0.1");
        assert!(limiter.check_at(&anonymous, 0).await.allowed);
        assert!(!limiter.check_at(&anonymous, 0).await.allowed);

        let premium = ClientKey::by_user("u-1", RateLimitTier::Premium);
        for _ in 0..3 {
            assert!(limiter.check_at(&premium, 0).await.allowed);
        }
        let rejected = limiter.check_at(&premium, 0).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.limit, 3);
        assert_eq!(rejected.backend, LimiterBackend::Local);
    }

    #[tokio::test]
    async fn test_outage_falls_back_to_local_limits() {
        let store = Arc::new(MemoryBucketStore::new());
        let limiter = limiter_with_store(store.clone());
        let key = ClientKey::by_ip("10.1.1.1");

        for _ in 0..10 {
            assert!(limiter.check_at(&key, 0).await.allowed);
        }

        store.set_available(false);

        let mut admitted = 0;
        for _ in 0..150 {
            let decision = limiter.check_at(&key, 100).await;
            assert_eq!(decision.backend, LimiterBackend::Local);
            if decision.allowed {
                admitted += 1;
            }
        }
        // 仍然受限（按实例计），而不是全部放行
        assert_eq!(admitted, 100);
        assert!(limiter.is_degraded());
    }

    #[tokio::test]
    async fn test_recovers_after_probe_interval() {
        let store = Arc::new(MemoryBucketStore::new());
        let limiter = limiter_with_store(store.clone());
        let key = ClientKey::by_user("u-9", RateLimitTier::Authenticated);

        store.set_available(false);
        assert_eq!(limiter.check_at(&key, 0).await.backend, LimiterBackend::Local);

        store.set_available(true);
        // 探测间隔内继续使用本地桶
        assert_eq!(limiter.check_at(&key, 1_000).await.backend, LimiterBackend::Local);
        assert!(limiter.is_degraded());

        let decision = limiter.check_at(&key, 6_000).await;
        assert_eq!(decision.backend, LimiterBackend::Shared);
        assert!(!limiter.is_degraded());
    }

    #[tokio::test]
    async fn test_cleanup_idle_local_buckets() {
        let limiter = RateLimiter::new(TierLimits::default(), None).with_local_idle_ttl(Duration::from_secs(10));

        limiter.check_at(&ClientKey::by_ip("1.1.1.1"), 0).await;
        limiter.check_at(&ClientKey::by_ip("2.2.2.2"), 8_000).await;

        assert_eq!(limiter.cleanup_idle(12_000).await, 1);
        assert_eq!(limiter.local_bucket_count().await, 1);
    }
}
