use thiserror::Error;

/// 网关统一错误类型
///
/// 所有变体都只携带字符串，保证 `Clone`，以便 single-flight 的等待者共享同一个结果。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Authorization code exchange failed: {0}")]
    AuthExchangeFailed(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("CSRF check failed: {0}")]
    CsrfRejected(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rate limit exceeded for {client_key}")]
    RateLimitExceeded {
        client_key: String,
        limit: u64,
        retry_after_secs: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, GateError>;

impl GateError {
    /// 机器可读的错误码，出现在响应体的 `error` 字段
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::AuthExchangeFailed(_) => "AUTH_EXCHANGE_FAILED",
            GateError::InvalidToken(_) => "INVALID_TOKEN",
            GateError::SessionExpired(_) => "SESSION_EXPIRED",
            GateError::Unauthenticated => "UNAUTHENTICATED",
            GateError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            GateError::Forbidden(_) => "FORBIDDEN",
            GateError::CsrfRejected(_) => "CSRF_PROTECTION",
            GateError::BadRequest(_) => "BAD_REQUEST",
            GateError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GateError::NotFound(_) => "NOT_FOUND",
            GateError::Store(_) | GateError::Config(_) | GateError::Internal(_) => "INTERNAL",
        }
    }

    /// 只有上游暂时不可用才值得重试；鉴权与会话错误对当前请求是终态
    pub fn is_retryable(&self) -> bool {
        matches!(self, GateError::UpstreamUnavailable(_))
    }
}

impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        GateError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::Store(format!("serialization: {}", err))
    }
}
