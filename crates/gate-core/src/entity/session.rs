use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 会话记录：不透明的 session id 与一对令牌及其过期时间的对应关系
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// 订阅等级（来自 access token 的 `tier` claim）
    #[serde(default)]
    pub tier: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// 每次令牌轮换递增，用于 compare-and-swap
    #[serde(default)]
    pub version: u64,
}

/// 一次令牌签发（兑换或刷新）的结果
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        session_id: String,
        user_id: String,
        username: Option<String>,
        tokens: IssuedTokens,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            username,
            email: None,
            tier: None,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            access_token_expires_at: tokens.access_token_expires_at,
            refresh_token_expires_at: tokens.refresh_token_expires_at,
            created_at: now,
            last_accessed_at: now,
            version: 1,
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    pub fn with_tier(mut self, tier: Option<String>) -> Self {
        self.tier = tier;
        self
    }

    pub fn is_access_token_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.access_token_expires_at
    }

    pub fn is_refresh_token_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_token_expires_at
    }

    /// access token 是否已进入刷新窗口
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.access_token_expires_at
    }

    /// 会话只要 refresh token 未过期就仍然有效
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.is_refresh_token_expired(now)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
    }

    /// 用新签发的令牌替换旧令牌，令牌与过期时间总是一起更新
    pub fn rotate(&self, tokens: IssuedTokens, now: DateTime<Utc>) -> Session {
        let mut next = self.clone();
        next.access_token = tokens.access_token;
        next.access_token_expires_at = tokens.access_token_expires_at;
        // 部分 IdP 刷新时不会轮换 refresh token，此时旧令牌的过期时间不变
        if tokens.refresh_token.is_some() {
            next.refresh_token = tokens.refresh_token;
            next.refresh_token_expires_at = tokens.refresh_token_expires_at;
        }
        next.last_accessed_at = now;
        next.version = self.version + 1;
        next
    }

    /// 会话在存储中的 TTL：到 refresh token 过期为止，但不超过 `max_ttl`
    pub fn store_ttl(&self, now: DateTime<Utc>, max_ttl: std::time::Duration) -> std::time::Duration {
        let remaining = (self.refresh_token_expires_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        remaining.min(max_ttl)
    }

    /// 日志里只打印 session id 的前缀
    pub fn short_id(&self) -> &str {
        short_session_id(&self.session_id)
    }
}

pub fn short_session_id(session_id: &str) -> &str {
    match session_id.char_indices().nth(8) {
        Some((idx, _)) => &session_id[..idx],
        None => session_id,
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.short_id())
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("tier", &self.tier)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .field("version", &self.version)
            .finish()
    }
}

impl fmt::Debug for IssuedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedTokens")
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .finish_non_exhaustive()
    }
}
