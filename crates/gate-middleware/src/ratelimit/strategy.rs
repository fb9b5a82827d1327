use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 客户端等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitTier {
    /// 匿名客户端，按 IP 计数
    Anonymous,
    /// 已登录用户，按用户 ID 计数
    Authenticated,
    /// 订阅用户
    Premium,
}

impl RateLimitTier {
    /// 由会话的 tier claim 推导
    pub fn from_claim(tier: Option<&str>) -> Self {
        match tier {
            Some(t) if t.eq_ignore_ascii_case("premium") => RateLimitTier::Premium,
            _ => RateLimitTier::Authenticated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitTier::Anonymous => "ANONYMOUS",
            RateLimitTier::Authenticated => "AUTHENTICATED",
            RateLimitTier::Premium => "PREMIUM",
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 限流键：`ip:<addr>` 或 `user:<id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    key: String,
    tier: RateLimitTier,
}

impl ClientKey {
    /// 按 IP 限流
    pub fn by_ip(addr: &str) -> Self {
        Self {
            key: format!("ip:{}", addr.trim_start_matches('[').trim_end_matches(']')),
            tier: RateLimitTier::Anonymous,
        }
    }

    /// 按用户限流
    pub fn by_user(user_id: &str, tier: RateLimitTier) -> Self {
        Self {
            key: format!("user:{}", user_id),
            tier,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn tier(&self) -> RateLimitTier {
        self.tier
    }
}

/// 单个桶的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: u64,
    pub refill_per_sec: f64,
    /// 空闲桶在共享存储中的过期时间
    pub idle_ttl: Duration,
}

/// 各等级的容量；补充速率 = 容量 / 窗口
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimits {
    pub anonymous: u64,
    pub authenticated: u64,
    pub premium: u64,
    pub window: Duration,
}

impl TierLimits {
    pub fn new(anonymous: u64, authenticated: u64, premium: u64, window: Duration) -> Self {
        Self {
            anonymous,
            authenticated,
            premium,
            window,
        }
    }

    pub fn capacity(&self, tier: RateLimitTier) -> u64 {
        match tier {
            RateLimitTier::Anonymous => self.anonymous,
            RateLimitTier::Authenticated => self.authenticated,
            RateLimitTier::Premium => self.premium,
        }
    }

    pub fn params(&self, tier: RateLimitTier) -> BucketParams {
        let capacity = self.capacity(tier);
        let window_secs = self.window.as_secs_f64().max(0.001);
        BucketParams {
            capacity,
            refill_per_sec: capacity as f64 / window_secs,
            idle_ttl: self.window * 2,
        }
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self::new(100, 1000, 10_000, Duration::from_secs(60))
    }
}
