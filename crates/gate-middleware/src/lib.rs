//! 网关请求准入核心：会话、令牌刷新、策略/权限缓存与分布式限流

pub mod auth;
pub mod pipeline;
pub mod ratelimit;
pub mod session;

pub use auth::{CsrfGuard, PermissionCache, PolicyCache, PolicyDecision, TokenExchangeCoordinator, TokenValidator};
pub use pipeline::{GateContext, Pipeline, RequestInfo, Stage};
pub use ratelimit::{ClientKey, RateLimitDecision, RateLimitTier, RateLimiter, TierLimits};
pub use session::{PendingLoginStore, SessionManager, SessionStore};
