//! `/auth/*`：PKCE 登录、会话创建/查询/刷新/注销

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gate_core::{GateError, Session, TokenResponse};
use gate_middleware::auth::pkce;
use serde::Deserialize;
use std::sync::Arc;

use crate::cookie;
use crate::error::ApiError;
use crate::AppState;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// `POST /auth/session` 请求体：客户端已持有的令牌对
#[derive(Deserialize)]
pub struct CreateSessionRequest {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "refreshExpiresIn")]
    pub refresh_expires_in: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    pub code: String,
    pub code_verifier: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn session_created(state: &AppState, session: &Session) -> Response {
    let set_cookie = cookie::session_cookie(
        &session.session_id,
        state.config.session.ttl_secs,
        state.config.session.cookie_secure,
    );
    (
        StatusCode::OK,
        [(header::SET_COOKIE, set_cookie)],
        Json(serde_json::json!({ "sessionId": session.session_id })),
    )
        .into_response()
}

/// 从请求中解析当前有效会话
async fn current_session(state: &AppState, headers: &HeaderMap) -> ApiResult<Session> {
    let Some(session_id) = cookie::session_id(headers) else {
        return Err(GateError::Unauthenticated.into());
    };
    state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| GateError::SessionExpired("session expired or unknown".to_string()).into())
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Response> {
    let response = TokenResponse {
        access_token: req.access_token,
        refresh_token: req.refresh_token,
        token_type: Some("Bearer".to_string()),
        expires_in: None,
        refresh_expires_in: req.refresh_expires_in,
        scope: None,
    };
    let session = state.coordinator.create_from_tokens(response).await?;
    Ok(session_created(&state, &session))
}

pub async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<serde_json::Value>> {
    let session = current_session(&state, &headers).await?;
    let authenticated = !session.is_access_token_expired(chrono::Utc::now());

    Ok(Json(serde_json::json!({
        "userId": session.user_id,
        "username": session.username,
        "email": session.email,
        "authenticated": authenticated,
    })))
}

pub async fn refresh(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Json<serde_json::Value>> {
    let session = current_session(&state, &headers).await?;
    let refreshed = state.coordinator.force_refresh(session).await?;

    Ok(Json(serde_json::json!({
        "sessionId": refreshed.session_id,
        "accessTokenExpiresAt": refreshed.access_token_expires_at.to_rfc3339(),
    })))
}

pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Response> {
    if let Some(session_id) = cookie::session_id(&headers) {
        state.sessions.delete(&session_id).await?;
    }

    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie::clear_session_cookie(state.config.session.cookie_secure))],
        Json(serde_json::json!({ "status": "logged_out" })),
    )
        .into_response())
}

/// 生成 verifier/state，重定向到 IdP 授权端点
pub async fn login(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let identity = &state.config.identity;
    let verifier = pkce::generate_code_verifier();
    let login_state = pkce::generate_state();

    let location = reqwest::Url::parse_with_params(
        &identity.auth_url,
        &[
            ("response_type", "code"),
            ("client_id", identity.client_id.as_str()),
            ("redirect_uri", identity.redirect_uri.as_str()),
            ("state", login_state.as_str()),
            ("code_challenge", pkce::code_challenge(&verifier).as_str()),
            ("code_challenge_method", "S256"),
            ("scope", identity.scopes.join(" ").as_str()),
        ],
    )
    .map_err(|e| GateError::Config(format!("invalid identity.auth_url: {}", e)))?;

    state
        .pending_logins
        .put(&login_state, &verifier, state.config.session.pending_login_ttl())
        .await?;

    tracing::debug!("Redirecting to identity provider");
    Ok((StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response())
}

pub async fn callback(State(state): State<Arc<AppState>>, Query(query): Query<CallbackQuery>) -> ApiResult<Response> {
    if let Some(error) = query.error {
        tracing::warn!(error = %error, "Identity provider returned an error on callback");
        return Err(GateError::AuthExchangeFailed(error).into());
    }
    let (Some(code), Some(login_state)) = (query.code, query.state) else {
        return Err(GateError::AuthExchangeFailed("missing code or state".to_string()).into());
    };

    let Some(verifier) = state.pending_logins.take(&login_state).await? else {
        return Err(GateError::AuthExchangeFailed("unknown or expired login state".to_string()).into());
    };

    let session = state.coordinator.exchange(&code, &verifier).await?;
    Ok(session_created(&state, &session))
}

pub async fn exchange(State(state): State<Arc<AppState>>, Json(req): Json<ExchangeRequest>) -> ApiResult<Response> {
    let session = state.coordinator.exchange(&req.code, &req.code_verifier).await?;
    Ok(session_created(&state, &session))
}
