use chrono::{DateTime, Utc};
use gate_core::{Result, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::SessionStore;

/// 最近访问时间的最小写回间隔
const TOUCH_INTERVAL_SECS: i64 = 60;

/// 会话管理器
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionManager {
    /// `ttl` 为存储 TTL 上限；实际 TTL 不超过 refresh token 的剩余寿命
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn store_ttl(&self, session: &Session, now: DateTime<Utc>) -> Duration {
        session.store_ttl(now, self.ttl)
    }

    /// 保存新会话
    pub async fn create(&self, session: &Session) -> Result<()> {
        let ttl = self.store_ttl(session, Utc::now());
        self.store.save(session, ttl).await?;

        info!(
            session_id = %session.short_id(),
            user_id = %session.user_id,
            ttl_secs = ttl.as_secs(),
            "Session created"
        );
        Ok(())
    }

    /// 获取会话；refresh token 已过期的会话会被删除并视为不存在
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(session) = self.store.load(session_id).await? else {
            return Ok(None);
        };

        if !session.is_valid(Utc::now()) {
            self.store.delete(session_id).await?;
            debug!(session_id = %session.short_id(), "Session expired and removed");
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// 原样读取（不做过期判断），供刷新流程比较版本使用
    pub async fn load_raw(&self, session_id: &str) -> Result<Option<Session>> {
        self.store.load(session_id).await
    }

    /// 以 `expected_version` 为前提写入新版本
    pub async fn replace(&self, expected_version: u64, next: &Session) -> Result<bool> {
        let ttl = self.store_ttl(next, Utc::now());
        let swapped = self.store.compare_and_swap(expected_version, next, ttl).await?;
        debug!(
            session_id = %next.short_id(),
            expected_version,
            new_version = next.version,
            swapped,
            "Session compare-and-swap"
        );
        Ok(swapped)
    }

    /// 更新最近访问时间
    ///
    /// 不改变版本号；与并发的令牌轮换冲突时放弃本次写入。
    pub async fn touch(&self, session: &Session) -> Result<()> {
        let now = Utc::now();
        if (now - session.last_accessed_at).num_seconds() < TOUCH_INTERVAL_SECS {
            return Ok(());
        }

        let mut touched = session.clone();
        touched.touch(now);
        let ttl = self.store_ttl(&touched, now);
        self.store.compare_and_swap(session.version, &touched, ttl).await?;
        Ok(())
    }

    /// 删除会话
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.store.delete(session_id).await?;
        info!(session_id = %gate_core::entity::short_session_id(session_id), "Session deleted");
        Ok(())
    }

    /// 启动定期清理任务
    pub fn start_cleanup_task(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;

                match store.cleanup_expired().await {
                    Ok(removed) => {
                        if removed > 0 {
                            info!(removed = removed, "Cleaned up expired sessions");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to cleanup expired sessions");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use gate_core::IssuedTokens;

    fn session(id: &str, refresh_valid_for: chrono::Duration) -> Session {
        let now = Utc::now();
        Session::new(
            id.to_string(),
            "user123".to_string(),
            Some("alice".to_string()),
            IssuedTokens {
                access_token: "access".to_string(),
                refresh_token: Some("refresh".to_string()),
                access_token_expires_at: now + chrono::Duration::minutes(5),
                refresh_token_expires_at: now + refresh_valid_for,
            },
            now,
        )
    }

    #[tokio::test]
    async fn test_session_manager() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store, Duration::from_secs(3600));

        let session = session("sid-1", chrono::Duration::days(30));
        manager.create(&session).await.unwrap();

        let loaded = manager.get("sid-1").await.unwrap();
        assert_eq!(loaded.unwrap().username.as_deref(), Some("alice"));

        manager.delete("sid-1").await.unwrap();
        assert!(manager.get("sid-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_refresh_token_removes_session() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), Duration::from_secs(3600));

        let mut stale = session("sid-2", chrono::Duration::days(30));
        stale.refresh_token_expires_at = Utc::now() - chrono::Duration::seconds(1);
        // 绕过 create 的 TTL 计算直接写入
        store.save(&stale, Duration::from_secs(60)).await.unwrap();

        assert!(manager.get("sid-2").await.unwrap().is_none());
        assert!(manager.load_raw("sid-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_keeps_version() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store, Duration::from_secs(3600));

        let mut session = session("sid-3", chrono::Duration::days(30));
        session.last_accessed_at = Utc::now() - chrono::Duration::minutes(5);
        manager.create(&session).await.unwrap();

        manager.touch(&session).await.unwrap();

        let loaded = manager.get("sid-3").await.unwrap().unwrap();
        assert_eq!(loaded.version, session.version);
        assert!(loaded.last_accessed_at > session.last_accessed_at);
    }

    #[tokio::test]
    async fn test_replace_rejects_stale_version() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store, Duration::from_secs(3600));

        let session = session("sid-4", chrono::Duration::days(30));
        manager.create(&session).await.unwrap();

        let mut next = session.clone();
        next.version += 1;
        assert!(manager.replace(session.version, &next).await.unwrap());
        assert!(!manager.replace(session.version, &next).await.unwrap());
    }
}
