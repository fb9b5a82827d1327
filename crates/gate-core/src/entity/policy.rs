use serde::{Deserialize, Deserializer, Serialize};

/// 一条端点保护规则（来自策略源）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointProtectionRule {
    /// HTTP 方法，`*` 匹配任意方法
    pub method: String,

    /// Ant 风格路径模式，如 `/orders/**`
    #[serde(alias = "pattern")]
    pub path_pattern: String,

    #[serde(default)]
    pub permission_code: Option<String>,

    /// 为 true 时忽略 `permission_code`
    #[serde(default, rename = "public", alias = "isPublic")]
    pub is_public: bool,

    #[serde(default, deserialize_with = "null_as_zero")]
    pub priority: i32,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i32>::deserialize(deserializer)?.unwrap_or(0))
}

impl EndpointProtectionRule {
    pub fn public(method: &str, path_pattern: &str, priority: i32) -> Self {
        Self {
            method: method.to_string(),
            path_pattern: path_pattern.to_string(),
            permission_code: None,
            is_public: true,
            priority,
            active: true,
        }
    }

    pub fn protected(method: &str, path_pattern: &str, permission_code: &str, priority: i32) -> Self {
        Self {
            method: method.to_string(),
            path_pattern: path_pattern.to_string(),
            permission_code: Some(permission_code.to_string()),
            is_public: false,
            priority,
            active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn method_matches(&self, method: &str) -> bool {
        self.method == "*" || self.method.eq_ignore_ascii_case(method)
    }
}
