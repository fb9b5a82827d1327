use serde::{Deserialize, Serialize};

/// 单个客户端键的令牌桶状态
///
/// 补充量只由 `last_refill_at_ms` 到当前时间的间隔和固定速率决定；
/// 任何操作之后都满足 `0 <= tokens <= capacity`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub client_key: String,
    pub capacity: u64,
    pub tokens: f64,
    pub last_refill_at_ms: i64,
}

impl RateLimitBucket {
    /// 新桶是满的
    pub fn new(client_key: &str, capacity: u64, now_ms: i64) -> Self {
        Self {
            client_key: client_key.to_string(),
            capacity,
            tokens: capacity as f64,
            last_refill_at_ms: now_ms,
        }
    }

    /// 按经过的时间补充令牌；时钟回拨时不补充也不回退时间戳
    pub fn refill(&mut self, now_ms: i64, refill_per_sec: f64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_at_ms).max(0);
        if elapsed_ms > 0 {
            let added = elapsed_ms as f64 * refill_per_sec / 1000.0;
            self.tokens = (self.tokens + added).min(self.capacity as f64);
            self.last_refill_at_ms = now_ms;
        }
        self.tokens = self.tokens.clamp(0.0, self.capacity as f64);
    }

    /// 补充后尝试取一个令牌
    pub fn try_take(&mut self, now_ms: i64, refill_per_sec: f64) -> bool {
        self.refill(now_ms, refill_per_sec);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> u64 {
        self.tokens.max(0.0).floor() as u64
    }

    /// 下一个令牌可用前需要等待的整秒数（拒绝时至少 1）
    pub fn retry_after_secs(&self, refill_per_sec: f64) -> u64 {
        retry_after_secs(self.tokens, refill_per_sec)
    }
}

pub fn retry_after_secs(tokens: f64, refill_per_sec: f64) -> u64 {
    if tokens >= 1.0 {
        return 0;
    }
    if refill_per_sec <= 0.0 {
        return u64::MAX;
    }
    (((1.0 - tokens) / refill_per_sec).ceil() as u64).max(1)
}
