use async_trait::async_trait;
use chrono::Utc;
use gate_core::{GateError, Result, Session};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{GateContext, RequestInfo, Stage};
use crate::auth::{CsrfGuard, PermissionCache, PolicyCache, PolicyDecision, TokenExchangeCoordinator};
use crate::ratelimit::{ClientKey, RateLimitTier, RateLimiter};
use crate::session::SessionManager;

/// 0. 有副作用的请求必须带 CSRF 防护头，先于会话解析
pub struct CsrfStage {
    guard: Arc<CsrfGuard>,
}

impl CsrfStage {
    pub fn new(guard: Arc<CsrfGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Stage for CsrfStage {
    fn name(&self) -> &'static str {
        "csrf"
    }

    async fn process(&self, request: &RequestInfo, _ctx: &mut GateContext) -> Result<()> {
        self.guard.check(&request.method, &request.path, request.csrf_header)
    }
}

/// 1. 按 session id 解析会话
pub struct SessionStage {
    sessions: Arc<SessionManager>,
}

impl SessionStage {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Stage for SessionStage {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn process(&self, request: &RequestInfo, ctx: &mut GateContext) -> Result<()> {
        let Some(session_id) = request.session_id.as_deref() else {
            return Ok(());
        };

        match self.sessions.get(session_id).await {
            Ok(Some(session)) => {
                if let Err(e) = self.sessions.touch(&session).await {
                    debug!(session_id = %session.short_id(), error = %e, "Failed to touch session");
                }
                ctx.session = Some(session);
            }
            Ok(None) => ctx.stale_session = true,
            Err(e) => {
                warn!(error = %e, "Session lookup failed");
                ctx.session_error = Some(e);
            }
        }
        Ok(())
    }
}

/// 2. access token 临近过期时透明刷新
pub struct TokenFreshnessStage {
    coordinator: Arc<TokenExchangeCoordinator>,
}

impl TokenFreshnessStage {
    pub fn new(coordinator: Arc<TokenExchangeCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Stage for TokenFreshnessStage {
    fn name(&self) -> &'static str {
        "token_freshness"
    }

    async fn process(&self, _request: &RequestInfo, ctx: &mut GateContext) -> Result<()> {
        let Some(session) = ctx.session.take() else {
            return Ok(());
        };

        match self.coordinator.ensure_fresh(session.clone()).await {
            Ok(fresh) => ctx.session = Some(fresh),
            Err(GateError::SessionExpired(_)) => ctx.stale_session = true,
            // IdP 暂时不可用但旧 token 还没过期：继续使用
            Err(e) if !session.is_access_token_expired(Utc::now()) => {
                warn!(session_id = %session.short_id(), error = %e, "Token refresh failed, using current token");
                ctx.session = Some(session);
            }
            Err(e) => {
                warn!(session_id = %session.short_id(), error = %e, "Token refresh failed");
                ctx.session_error = Some(e);
            }
        }
        Ok(())
    }
}

/// 3. 策略匹配 + 权限检查
pub struct AuthorizationStage {
    policy: Arc<PolicyCache>,
    permissions: Arc<PermissionCache>,
}

impl AuthorizationStage {
    pub fn new(policy: Arc<PolicyCache>, permissions: Arc<PermissionCache>) -> Self {
        Self { policy, permissions }
    }
}

fn require_session(ctx: &GateContext) -> Result<&Session> {
    if let Some(session) = ctx.session.as_ref() {
        return Ok(session);
    }
    if let Some(e) = &ctx.session_error {
        return Err(e.clone());
    }
    if ctx.stale_session {
        return Err(GateError::SessionExpired("session expired or unknown".to_string()));
    }
    Err(GateError::Unauthenticated)
}

#[async_trait]
impl Stage for AuthorizationStage {
    fn name(&self) -> &'static str {
        "authorization"
    }

    async fn process(&self, request: &RequestInfo, ctx: &mut GateContext) -> Result<()> {
        let decision = self.policy.decide(&request.method, &request.path);
        ctx.decision = Some(decision.clone());

        match decision {
            PolicyDecision::Public => Ok(()),
            PolicyDecision::NoMatch => {
                warn!(method = %request.method, path = %request.path, "No policy rule matched, denying");
                Err(GateError::Forbidden("no matching rule".to_string()))
            }
            PolicyDecision::RequiresAuthentication => require_session(ctx).map(|_| ()),
            PolicyDecision::RequiresPermission(code) => {
                let user_id = require_session(ctx)?.user_id.clone();

                if self.permissions.has_permission(&user_id, &code).await? {
                    ctx.checked_permission = Some(code);
                    Ok(())
                } else {
                    warn!(
                        user_id = %user_id,
                        path = %request.path,
                        required = %code,
                        "Access denied"
                    );
                    Err(GateError::Forbidden(format!("missing permission {}", code)))
                }
            }
        }
    }
}

/// 4. 令牌桶限流
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn process(&self, request: &RequestInfo, ctx: &mut GateContext) -> Result<()> {
        let key = match &ctx.session {
            Some(session) => ClientKey::by_user(&session.user_id, RateLimitTier::from_claim(session.tier.as_deref())),
            None => ClientKey::by_ip(&request.client_ip),
        };

        let decision = self.limiter.check(&key).await;
        let result = if decision.allowed {
            Ok(())
        } else {
            Err(GateError::RateLimitExceeded {
                client_key: decision.client_key.clone(),
                limit: decision.limit,
                retry_after_secs: decision.retry_after_secs,
            })
        };
        ctx.rate_limit = Some(decision);
        result
    }
}
