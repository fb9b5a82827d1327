use async_trait::async_trait;
use gate_core::{Result, Session};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[cfg(feature = "redis-store")]
use gate_core::GateError;

/// 会话存储 trait
///
/// 所有实例共享同一份存储；写入都是单键原子操作。
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 保存会话（覆盖），`ttl` 到期后自动删除
    async fn save(&self, session: &Session, ttl: Duration) -> Result<()>;

    /// 加载会话
    async fn load(&self, session_id: &str) -> Result<Option<Session>>;

    /// 删除会话
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// 仅当存储中的版本等于 `expected_version` 时写入
    ///
    /// 返回 false 表示记录已被其他请求更新或已删除。
    async fn compare_and_swap(&self, expected_version: u64, session: &Session, ttl: Duration) -> Result<bool>;

    /// 清理过期会话
    async fn cleanup_expired(&self) -> Result<u64>;
}

struct StoredSession {
    session: Session,
    expires_at: Instant,
}

/// 内存会话存储（用于开发、测试和单实例部署）
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session, ttl: Duration) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.session_id.clone(),
            StoredSession {
                session: session.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .filter(|stored| stored.expires_at > Instant::now())
            .map(|stored| stored.session.clone()))
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
        Ok(())
    }

    async fn compare_and_swap(&self, expected_version: u64, session: &Session, ttl: Duration) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();

        match sessions.get_mut(&session.session_id) {
            Some(stored) if stored.expires_at > now && stored.session.version == expected_version => {
                stored.session = session.clone();
                stored.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let before_count = sessions.len();
        let now = Instant::now();

        sessions.retain(|_, stored| stored.expires_at > now);

        Ok((before_count - sessions.len()) as u64)
    }
}

/// Redis 会话存储
#[cfg(feature = "redis-store")]
pub struct RedisSessionStore {
    client: redis::Client,
    key_prefix: String,
}

#[cfg(feature = "redis-store")]
const CAS_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local decoded = cjson.decode(current)
if tonumber(decoded['version']) ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
";

#[cfg(feature = "redis-store")]
impl RedisSessionStore {
    pub fn new(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| GateError::Config(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.key_prefix, session_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_error)
    }
}

#[cfg(feature = "redis-store")]
fn store_error(err: redis::RedisError) -> GateError {
    GateError::Store(format!("redis: {}", err))
}

// Redis 的 EX 不接受 0
#[cfg(feature = "redis-store")]
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[cfg(feature = "redis-store")]
#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn save(&self, session: &Session, ttl: Duration) -> Result<()> {
        use redis::AsyncCommands;

        let mut conn = self.connection().await?;
        let json = serde_json::to_string(session)?;

        conn.set_ex::<_, _, ()>(self.key(&session.session_id), json, ttl_secs(ttl))
            .await
            .map_err(store_error)
    }

    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        use redis::AsyncCommands;

        let mut conn = self.connection().await?;
        let result: Option<String> = conn.get(self.key(session_id)).await.map_err(store_error)?;

        match result {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        use redis::AsyncCommands;

        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.key(session_id)).await.map_err(store_error)
    }

    async fn compare_and_swap(&self, expected_version: u64, session: &Session, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(session)?;

        let swapped: i32 = redis::Script::new(CAS_SCRIPT)
            .key(self.key(&session.session_id))
            .arg(expected_version)
            .arg(json)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(swapped == 1)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        // Redis 自动处理过期
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gate_core::entity::IssuedTokens;

    fn session(id: &str) -> Session {
        let now = Utc::now();
        Session::new(
            id.to_string(),
            "user123".to_string(),
            None,
            IssuedTokens {
                access_token: "access".to_string(),
                refresh_token: Some("refresh".to_string()),
                access_token_expires_at: now + chrono::Duration::minutes(5),
                refresh_token_expires_at: now + chrono::Duration::days(30),
            },
            now,
        )
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        let session = session("s-1");

        store.save(&session, Duration::from_secs(60)).await.unwrap();

        let loaded = store.load("s-1").await.unwrap();
        assert_eq!(loaded.unwrap().user_id, "user123");

        store.delete("s-1").await.unwrap();
        assert!(store.load("s-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemorySessionStore::new();
        let original = session("s-2");
        store.save(&original, Duration::from_secs(60)).await.unwrap();

        let mut next = original.clone();
        next.access_token = "access-2".to_string();
        next.version = original.version + 1;

        assert!(store.compare_and_swap(original.version, &next, Duration::from_secs(60)).await.unwrap());
        // 第二次使用旧版本号必须失败
        assert!(!store.compare_and_swap(original.version, &next, Duration::from_secs(60)).await.unwrap());

        let loaded = store.load("s-2").await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "access-2");

        // 已删除的记录不能被 CAS 复活
        store.delete("s-2").await.unwrap();
        assert!(!store.compare_and_swap(next.version, &next, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_and_cleanup() {
        let store = MemorySessionStore::new();
        store.save(&session("short"), Duration::from_secs(10)).await.unwrap();
        store.save(&session("long"), Duration::from_secs(3600)).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(store.load("short").await.unwrap().is_none());
        assert!(store.load("long").await.unwrap().is_some());

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
    }
}
