use gate_core::RateLimitBucket;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// 一次取令牌的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeOutcome {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_secs: u64,
}

impl TakeOutcome {
    pub fn from_tokens(allowed: bool, tokens: f64, refill_per_sec: f64) -> Self {
        Self {
            allowed,
            remaining: tokens.max(0.0).floor() as u64,
            retry_after_secs: if allowed {
                0
            } else {
                gate_core::entity::bucket::retry_after_secs(tokens, refill_per_sec)
            },
        }
    }
}

/// 本地（单实例）令牌桶
pub struct TokenBucket {
    state: RwLock<RateLimitBucket>,
    refill_per_sec: f64,
    last_used_ms: AtomicI64,
}

impl TokenBucket {
    /// 创建新的令牌桶（满）
    pub fn new(client_key: &str, capacity: u64, refill_per_sec: f64, now_ms: i64) -> Self {
        Self {
            state: RwLock::new(RateLimitBucket::new(client_key, capacity, now_ms)),
            refill_per_sec,
            last_used_ms: AtomicI64::new(now_ms),
        }
    }

    /// 尝试获取一个令牌（非阻塞）
    pub async fn try_acquire(&self, now_ms: i64) -> TakeOutcome {
        let mut state = self.state.write().await;
        let allowed = state.try_take(now_ms, self.refill_per_sec);
        self.last_used_ms.fetch_max(now_ms, Ordering::Relaxed);

        if allowed {
            debug!(key = %state.client_key, remaining = state.remaining(), "Token acquired");
        } else {
            debug!(key = %state.client_key, tokens = state.tokens, "Insufficient tokens");
        }
        TakeOutcome::from_tokens(allowed, state.tokens, self.refill_per_sec)
    }

    #[cfg(test)]
    async fn available(&self, now_ms: i64) -> u64 {
        let mut state = self.state.write().await;
        state.refill(now_ms, self.refill_per_sec);
        state.remaining()
    }

    pub fn last_used_ms(&self) -> i64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }
}
