use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gate_core::GateError;

/// HTTP 层错误：把 `GateError` 映射为状态码和统一的错误体
#[derive(Debug)]
pub struct ApiError(pub GateError);

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &GateError) -> StatusCode {
    match err {
        GateError::InvalidToken(_)
        | GateError::SessionExpired(_)
        | GateError::Unauthenticated
        | GateError::AuthExchangeFailed(_) => StatusCode::UNAUTHORIZED,
        GateError::Forbidden(_) | GateError::CsrfRejected(_) => StatusCode::FORBIDDEN,
        GateError::BadRequest(_) => StatusCode::BAD_REQUEST,
        GateError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        GateError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GateError::NotFound(_) => StatusCode::NOT_FOUND,
        GateError::Store(_) | GateError::Config(_) | GateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// 响应体只给出固定文案，不暴露缓存层级或后端
fn public_message(err: &GateError) -> &'static str {
    match err {
        GateError::AuthExchangeFailed(_) => "Authorization code exchange failed",
        GateError::InvalidToken(_) => "Invalid access token",
        GateError::SessionExpired(_) => "Session expired, please sign in again",
        GateError::Unauthenticated => "Authentication required",
        GateError::UpstreamUnavailable(_) => "Service temporarily unavailable",
        GateError::Forbidden(_) => "Access denied",
        GateError::CsrfRejected(_) => "Missing CSRF protection header. Add X-XSRF-TOKEN or X-Requested-With header.",
        GateError::BadRequest(_) => "Malformed request",
        GateError::RateLimitExceeded { .. } => "Too many requests",
        GateError::NotFound(_) => "Not found",
        GateError::Store(_) | GateError::Config(_) | GateError::Internal(_) => "Internal server error",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = Json(serde_json::json!({
            "error": self.0.kind(),
            "message": public_message(&self.0),
        }));
        let mut response = (status, body).into_response();

        if let GateError::RateLimitExceeded { retry_after_secs, .. } = &self.0 {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from((*retry_after_secs).max(1)));
        }
        response
    }
}
