use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// 网关配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub internal: InternalConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub upstreams: Vec<UpstreamRoute>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// 共享存储（会话、权限二级缓存、限流计数）。`url` 为空时全部使用进程内实现
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityConfig {
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// access token 校验参数
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JwtConfig {
    /// HS256 / HS384 / HS512 / RS256 / RS384 / RS512 / ES256 / ES384
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub public_key_pem: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// access token 距离过期小于该值时透明刷新
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    /// IdP 未返回 refresh_expires_in 时使用
    #[serde(default = "default_refresh_ttl_secs")]
    pub default_refresh_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
    #[serde(default = "default_pending_login_ttl_secs")]
    pub pending_login_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    #[serde(default = "default_policy_source_url")]
    pub source_url: String,
    #[serde(default = "default_policy_refresh_secs")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PermissionConfig {
    #[serde(default = "default_permission_origin_url")]
    pub origin_url: String,
    #[serde(default = "default_local_ttl_secs")]
    pub local_ttl_secs: u64,
    #[serde(default = "default_shared_ttl_secs")]
    pub shared_ttl_secs: u64,
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,
}

/// 网关调用策略源/权限源时使用的静态内部凭证
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InternalConfig {
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_anonymous_capacity")]
    pub anonymous_capacity: u64,
    #[serde(default = "default_authenticated_capacity")]
    pub authenticated_capacity: u64,
    #[serde(default = "default_premium_capacity")]
    pub premium_capacity: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// 降级期间探测共享存储的最小间隔
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_local_idle_ttl_secs")]
    pub local_idle_ttl_secs: u64,
    /// 只有来自这些地址的连接才采信 `X-Forwarded-For`
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

/// 有副作用的请求必须携带自定义头（浏览器跨站请求无法附加）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CsrfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 免检的路径前缀（按路径段匹配）
    #[serde(default = "default_csrf_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// 转发路由：路径前缀 -> 后端服务
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UpstreamRoute {
    pub prefix: String,
    pub url: String,
    #[serde(default)]
    pub strip_prefix: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` 或 `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

// 默认值函数
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_key_prefix() -> String {
    "gate".to_string()
}

fn default_auth_url() -> String {
    "http://localhost:8180/realms/gate/protocol/openid-connect/auth".to_string()
}

fn default_token_url() -> String {
    "http://localhost:8180/realms/gate/protocol/openid-connect/token".to_string()
}

fn default_client_id() -> String {
    "gateway".to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:8080/auth/callback".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string(), "profile".to_string()]
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_leeway_secs() -> u64 {
    30
}

fn default_session_ttl_secs() -> u64 {
    24 * 3600
}

fn default_refresh_margin_secs() -> u64 {
    30
}

fn default_refresh_ttl_secs() -> u64 {
    30 * 24 * 3600
}

fn default_true() -> bool {
    true
}

fn default_pending_login_ttl_secs() -> u64 {
    600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_policy_source_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_policy_refresh_secs() -> u64 {
    300
}

fn default_permission_origin_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_local_ttl_secs() -> u64 {
    60
}

fn default_shared_ttl_secs() -> u64 {
    3600
}

fn default_local_max_entries() -> usize {
    100_000
}

fn default_anonymous_capacity() -> u64 {
    100
}

fn default_authenticated_capacity() -> u64 {
    1000
}

fn default_premium_capacity() -> u64 {
    10_000
}

fn default_window_secs() -> u64 {
    60
}

fn default_probe_interval_secs() -> u64 {
    5
}

fn default_local_idle_ttl_secs() -> u64 {
    300
}

fn default_csrf_exempt_paths() -> Vec<String> {
    ["/auth/login", "/auth/callback", "/auth/session", "/auth/exchange"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9100".to_string()
}

// Default trait 实现
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            client_id: default_client_id(),
            client_secret: None,
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            secret: Some("default-secret-change-in-production".to_string()),
            public_key_pem: None,
            issuer: None,
            audience: None,
            leeway_secs: default_leeway_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            refresh_margin_secs: default_refresh_margin_secs(),
            default_refresh_ttl_secs: default_refresh_ttl_secs(),
            cookie_secure: true,
            pending_login_ttl_secs: default_pending_login_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            source_url: default_policy_source_url(),
            refresh_interval_secs: default_policy_refresh_secs(),
        }
    }
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            origin_url: default_permission_origin_url(),
            local_ttl_secs: default_local_ttl_secs(),
            shared_ttl_secs: default_shared_ttl_secs(),
            local_max_entries: default_local_max_entries(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            anonymous_capacity: default_anonymous_capacity(),
            authenticated_capacity: default_authenticated_capacity(),
            premium_capacity: default_premium_capacity(),
            window_secs: default_window_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            local_idle_ttl_secs: default_local_idle_ttl_secs(),
            trusted_proxies: Vec::new(),
        }
    }
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exempt_paths: default_csrf_exempt_paths(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn default_refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.default_refresh_ttl_secs)
    }

    pub fn pending_login_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_login_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn local_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.local_idle_ttl_secs)
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl GatewayConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        let rl = &self.ratelimit;
        if rl.anonymous_capacity == 0 || rl.authenticated_capacity == 0 || rl.premium_capacity == 0 {
            return Err(anyhow!("rate limit capacities must be greater than 0"));
        }
        if rl.window_secs == 0 {
            return Err(anyhow!("ratelimit.window_secs must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be greater than 0"));
        }
        if self.session.refresh_margin_secs >= self.session.ttl_secs {
            return Err(anyhow!(
                "session.refresh_margin_secs ({}) must be smaller than session.ttl_secs ({})",
                self.session.refresh_margin_secs,
                self.session.ttl_secs
            ));
        }

        let algorithm = self.jwt.algorithm.to_ascii_uppercase();
        if algorithm.starts_with("HS") {
            if self.jwt.secret.as_deref().map_or(true, str::is_empty) {
                return Err(anyhow!("jwt.secret is required for {}", algorithm));
            }
        } else if algorithm.starts_with("RS") || algorithm.starts_with("ES") {
            if self.jwt.public_key_pem.as_deref().map_or(true, str::is_empty) {
                return Err(anyhow!("jwt.public_key_pem is required for {}", algorithm));
            }
        } else {
            return Err(anyhow!("unsupported jwt.algorithm: {}", self.jwt.algorithm));
        }

        for route in &self.upstreams {
            if !route.prefix.starts_with('/') {
                return Err(anyhow!("upstream prefix must start with '/': {}", route.prefix));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ratelimit.anonymous_capacity, 100);
        assert_eq!(config.ratelimit.premium_capacity, 10_000);
        assert_eq!(config.session.refresh_margin(), Duration::from_secs(30));
        assert_eq!(config.listen_addr(), "127.0.0.1:8080");
        assert!(config.ratelimit.trusted_proxies.is_empty());
        assert!(config.csrf.enabled);
        assert!(config.csrf.exempt_paths.contains(&"/auth/session".to_string()));
    }

    #[test]
    fn test_trusted_proxies_parse_as_addresses() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [ratelimit]
            trusted_proxies = ["10.0.0.1", "::1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.ratelimit.trusted_proxies.len(), 2);
        assert!(toml::from_str::<GatewayConfig>("[ratelimit]\ntrusted_proxies = [\"not-an-ip\"]").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.ratelimit.window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.jwt.algorithm = "RS256".to_string();
        assert!(config.validate().is_err());
        config.jwt.public_key_pem = Some("-----BEGIN PUBLIC KEY-----".to_string());
        assert!(config.validate().is_ok());

        let mut config = GatewayConfig::default();
        config.session.refresh_margin_secs = config.session.ttl_secs;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.upstreams.push(UpstreamRoute {
            prefix: "api".to_string(),
            url: "http://localhost:9000".to_string(),
            strip_prefix: false,
        });
        assert!(config.validate().is_err());
    }
}
