use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// "用户 U 是否拥有权限 P" 的缓存结果，只靠 TTL 失效
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCacheEntry {
    pub user_id: String,
    pub permission_code: String,
    pub granted: bool,
    pub expires_at: DateTime<Utc>,
}

impl PermissionCacheEntry {
    pub fn new(user_id: &str, permission_code: &str, granted: bool, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            permission_code: permission_code.to_string(),
            granted,
            expires_at: now + ttl,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// 缓存键 `{userId}:{permissionCode}`
    pub fn cache_key(user_id: &str, permission_code: &str) -> String {
        format!("{}:{}", user_id, permission_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_freshness() {
        let now = Utc::now();
        let entry = PermissionCacheEntry::new("u1", "ORDER:CREATE", true, Duration::seconds(60), now);

        assert!(entry.is_fresh(now));
        assert!(entry.is_fresh(now + Duration::seconds(59)));
        assert!(!entry.is_fresh(now + Duration::seconds(60)));
        assert_eq!(PermissionCacheEntry::cache_key("u1", "ORDER:CREATE"), "u1:ORDER:CREATE");
    }
}
