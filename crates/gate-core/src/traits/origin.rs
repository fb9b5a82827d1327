use async_trait::async_trait;

use crate::entity::EndpointProtectionRule;
use crate::error::GateError;

/// 端点保护规则的权威来源
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// 按插入顺序返回全部规则
    async fn fetch_rules(&self) -> Result<Vec<EndpointProtectionRule>, GateError>;
}

/// 权限判定的权威来源
#[async_trait]
pub trait PermissionOrigin: Send + Sync {
    async fn has_permission(&self, user_id: &str, permission_code: &str) -> Result<bool, GateError>;
}
