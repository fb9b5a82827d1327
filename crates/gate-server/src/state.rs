use gate_config::{GatewayConfig, RedisConfig};
use gate_core::{IdentityProvider, PermissionOrigin, PolicySource, RetryPolicy};
use gate_middleware::auth::{MemorySharedPermissionCache, SharedPermissionCache};
use gate_middleware::ratelimit::{MemoryBucketStore, SharedBucketStore};
use gate_middleware::session::{MemoryPendingLoginStore, MemorySessionStore};
use gate_middleware::{
    CsrfGuard, PendingLoginStore, PermissionCache, Pipeline, PolicyCache, RateLimiter, SessionManager, SessionStore,
    TierLimits, TokenExchangeCoordinator, TokenValidator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clients::{build_http_client, HttpIdentityProvider, HttpPermissionOrigin, HttpPolicySource};

/// 外部协作方
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub policy_source: Arc<dyn PolicySource>,
    pub permission_origin: Arc<dyn PermissionOrigin>,
}

impl Collaborators {
    /// 基于配置的 HTTP 实现
    pub fn http(config: &GatewayConfig) -> anyhow::Result<Self> {
        let http = build_http_client(Duration::from_secs(config.identity.timeout_secs))?;
        Ok(Self {
            identity: Arc::new(HttpIdentityProvider::new(&config.identity)?),
            policy_source: Arc::new(HttpPolicySource::new(
                http.clone(),
                &config.policy.source_url,
                &config.internal,
            )),
            permission_origin: Arc::new(HttpPermissionOrigin::new(
                http,
                &config.permission.origin_url,
                &config.internal,
            )),
        })
    }
}

/// 多实例共享的存储后端
pub struct SharedBackends {
    pub sessions: Arc<dyn SessionStore>,
    pub pending_logins: Arc<dyn PendingLoginStore>,
    pub permissions: Option<Arc<dyn SharedPermissionCache>>,
    pub buckets: Option<Arc<dyn SharedBucketStore>>,
}

impl SharedBackends {
    /// 单节点部署与测试使用的进程内实现
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(MemorySessionStore::new()),
            pending_logins: Arc::new(MemoryPendingLoginStore::new()),
            permissions: Some(Arc::new(MemorySharedPermissionCache::new())),
            buckets: Some(Arc::new(MemoryBucketStore::new())),
        }
    }

    #[cfg(feature = "redis-store")]
    pub fn from_config(config: &RedisConfig) -> anyhow::Result<Self> {
        use gate_middleware::auth::RedisSharedPermissionCache;
        use gate_middleware::ratelimit::RedisBucketStore;
        use gate_middleware::session::{RedisPendingLoginStore, RedisSessionStore};

        let Some(url) = config.url.as_deref() else {
            return Ok(Self::in_memory());
        };
        let prefix = config.key_prefix.as_str();
        tracing::info!(key_prefix = prefix, "Using Redis shared backends");

        Ok(Self {
            sessions: Arc::new(RedisSessionStore::new(url, prefix)?),
            pending_logins: Arc::new(RedisPendingLoginStore::new(url, prefix)?),
            permissions: Some(Arc::new(RedisSharedPermissionCache::new(url, prefix)?)),
            buckets: Some(Arc::new(RedisBucketStore::new(url, prefix)?)),
        })
    }

    #[cfg(not(feature = "redis-store"))]
    pub fn from_config(config: &RedisConfig) -> anyhow::Result<Self> {
        if config.url.is_some() {
            tracing::warn!("redis.url is set but the redis-store feature is disabled, using in-memory backends");
        }
        Ok(Self::in_memory())
    }
}

/// 应用状态（供 main.rs 和测试使用）
pub struct AppState {
    pub config: GatewayConfig,
    pub sessions: Arc<SessionManager>,
    pub pending_logins: Arc<dyn PendingLoginStore>,
    pub coordinator: Arc<TokenExchangeCoordinator>,
    pub policy: Arc<PolicyCache>,
    pub permissions: Arc<PermissionCache>,
    pub limiter: Arc<RateLimiter>,
    pub csrf: Arc<CsrfGuard>,
    pub pipeline: Pipeline,
    /// 转发请求用的客户端
    pub http: reqwest::Client,
}

impl AppState {
    pub fn build(config: GatewayConfig, collaborators: Collaborators, backends: SharedBackends) -> anyhow::Result<Self> {
        let retry = RetryPolicy::new(
            config.retry.max_attempts,
            config.retry.base_delay(),
            config.retry.max_delay(),
        );

        let mut validator = TokenValidator::from_parts(
            &config.jwt.algorithm,
            config.jwt.secret.as_deref(),
            config.jwt.public_key_pem.as_deref(),
        )?
        .with_leeway(config.jwt.leeway_secs);
        if let Some(issuer) = &config.jwt.issuer {
            validator = validator.with_issuer(issuer);
        }
        if let Some(audience) = &config.jwt.audience {
            validator = validator.with_audience(audience);
        }

        let sessions = Arc::new(SessionManager::new(backends.sessions, config.session.ttl()));
        let coordinator = Arc::new(
            TokenExchangeCoordinator::new(collaborators.identity, validator, sessions.clone(), retry)
                .with_refresh_margin(config.session.refresh_margin())
                .with_default_refresh_ttl(config.session.default_refresh_ttl()),
        );

        let policy = Arc::new(PolicyCache::new(collaborators.policy_source, retry));

        let permissions = Arc::new(
            PermissionCache::new(collaborators.permission_origin, backends.permissions)
                .with_ttls(
                    Duration::from_secs(config.permission.local_ttl_secs),
                    Duration::from_secs(config.permission.shared_ttl_secs),
                )
                .with_local_capacity(config.permission.local_max_entries)
                .with_retry(retry),
        );

        let limits = TierLimits::new(
            config.ratelimit.anonymous_capacity,
            config.ratelimit.authenticated_capacity,
            config.ratelimit.premium_capacity,
            config.ratelimit.window(),
        );
        let limiter = Arc::new(
            RateLimiter::new(limits, backends.buckets)
                .with_probe_interval(config.ratelimit.probe_interval())
                .with_local_idle_ttl(config.ratelimit.local_idle_ttl())
                .with_retry(retry),
        );

        let csrf = Arc::new(if config.csrf.enabled {
            CsrfGuard::new(config.csrf.exempt_paths.clone())
        } else {
            CsrfGuard::disabled()
        });

        let pipeline = Pipeline::standard(
            csrf.clone(),
            sessions.clone(),
            coordinator.clone(),
            policy.clone(),
            permissions.clone(),
            limiter.clone(),
        );

        Ok(Self {
            config,
            sessions,
            pending_logins: backends.pending_logins,
            coordinator,
            policy,
            permissions,
            limiter,
            csrf,
            pipeline,
            http: build_http_client(Duration::from_secs(30))?,
        })
    }

    /// 策略刷新、过期会话清理、空闲本地桶清理
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.policy
                .start_refresh_task(Duration::from_secs(self.config.policy.refresh_interval_secs)),
            self.sessions.start_cleanup_task(self.config.session.cleanup_interval()),
            self.limiter.start_cleanup_task(self.config.ratelimit.local_idle_ttl()),
        ]
    }
}
