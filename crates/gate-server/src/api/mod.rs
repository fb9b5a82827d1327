pub mod auth;
pub mod gateway;
pub mod internal;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::AppState;

/// 路由：`/auth/*`、内部接口、健康检查，其余全部经过网关流水线
pub fn create_router(state: Arc<AppState>) -> Router {
    // `/auth/*` 依赖会话 cookie，与网关流量使用同一个 CSRF 检查
    let auth_routes = Router::new()
        .route("/auth/login", get(auth::login))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/exchange", post(auth::exchange))
        .route("/auth/session", post(auth::create_session))
        .route("/auth/me", get(auth::me))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route_layer(middleware::from_fn_with_state(state.clone(), csrf_guard));

    Router::new()
        .route("/health", get(health))
        .merge(auth_routes)
        .route("/internal/policies/refresh", post(internal::refresh_policies))
        .fallback(gateway::gate)
        .with_state(state)
}

async fn csrf_guard(State(state): State<Arc<AppState>>, request: Request<Body>, next: Next<Body>) -> Response {
    let checked = state.csrf.check(
        request.method().as_str(),
        request.uri().path(),
        gateway::has_csrf_header(request.headers()),
    );
    match checked {
        Ok(()) => next.run(request).await,
        Err(e) => ApiError(e).into_response(),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "policyVersion": state.policy.snapshot().version(),
    }))
}
