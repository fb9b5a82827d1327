use axum::{extract::State, http::HeaderMap, Json};
use gate_core::GateError;
use std::sync::Arc;

use crate::clients::INTERNAL_API_KEY_HEADER;
use crate::error::ApiError;
use crate::AppState;

/// 校验内部调用凭证；未配置 key 时一律拒绝
fn require_internal_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers.get(INTERNAL_API_KEY_HEADER).and_then(|v| v.to_str().ok());
    match (state.config.internal.api_key.as_deref(), presented) {
        (Some(expected), Some(presented)) if expected == presented => Ok(()),
        _ => {
            tracing::warn!("Rejected internal call with missing or wrong api key");
            Err(GateError::Forbidden("internal api key required".to_string()).into())
        }
    }
}

/// `POST /internal/policies/refresh`：立即重新拉取策略
pub async fn refresh_policies(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_internal_key(&state, &headers)?;

    let version = state.policy.refresh().await?;
    let rules = state.policy.snapshot().rules().len();
    tracing::info!(version, rules, "Policy refresh triggered via internal endpoint");

    Ok(Json(serde_json::json!({ "version": version, "rules": rules })))
}
