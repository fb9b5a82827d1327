//! 请求准入流水线：CSRF -> 会话 -> 令牌新鲜度 -> 授权 -> 限流
//!
//! 每个阶段实现同一个 `Stage` 契约，按固定顺序执行，任一阶段失败即终止。

pub mod stages;

use async_trait::async_trait;
use gate_core::{GateError, Result, Session};
use metrics::increment_counter;
use std::sync::Arc;
use tracing::debug;

use crate::auth::{CsrfGuard, PermissionCache, PolicyCache, PolicyDecision, TokenExchangeCoordinator};
use crate::ratelimit::{RateLimitDecision, RateLimiter};
use crate::session::SessionManager;

pub use stages::{AuthorizationStage, CsrfStage, RateLimitStage, SessionStage, TokenFreshnessStage};

/// 流水线需要的请求信息（与 HTTP 框架无关）
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub client_ip: String,
    pub session_id: Option<String>,
    pub trace_id: String,
    /// 是否携带了任一 CSRF 防护头
    pub csrf_header: bool,
}

/// 单个请求在各阶段之间传递的状态，只在本次请求内有效
#[derive(Debug, Default)]
pub struct GateContext {
    pub session: Option<Session>,
    /// 携带了会话 id，但会话不存在或已失效
    pub stale_session: bool,
    /// 会话解析/刷新时的基础设施错误，受保护端点会返回它
    pub session_error: Option<GateError>,
    pub decision: Option<PolicyDecision>,
    pub checked_permission: Option<String>,
    pub rate_limit: Option<RateLimitDecision>,
}

impl GateContext {
    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user_id.as_str())
    }
}

/// 流水线阶段
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, request: &RequestInfo, ctx: &mut GateContext) -> Result<()>;
}

/// 按顺序执行的阶段列表
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// 标准流水线
    pub fn standard(
        csrf: Arc<CsrfGuard>,
        sessions: Arc<SessionManager>,
        coordinator: Arc<TokenExchangeCoordinator>,
        policy: Arc<PolicyCache>,
        permissions: Arc<PermissionCache>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self::new()
            .stage(Arc::new(CsrfStage::new(csrf)))
            .stage(Arc::new(SessionStage::new(sessions)))
            .stage(Arc::new(TokenFreshnessStage::new(coordinator)))
            .stage(Arc::new(AuthorizationStage::new(policy, permissions)))
            .stage(Arc::new(RateLimitStage::new(limiter)))
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// 执行全部阶段；即使失败也返回已累积的上下文（用于限流响应头）
    pub async fn run(&self, request: &RequestInfo) -> (GateContext, Result<()>) {
        let mut ctx = GateContext::default();

        for stage in &self.stages {
            if let Err(e) = stage.process(request, &mut ctx).await {
                debug!(stage = stage.name(), error = %e, "Request rejected");
                increment_counter!("gate_requests_total", "outcome" => e.kind());
                return (ctx, Err(e));
            }
        }

        increment_counter!("gate_requests_total", "outcome" => "admitted");
        (ctx, Ok(()))
    }
}
