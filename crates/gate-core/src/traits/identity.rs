use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// IdP token 端点的响应
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_expires_in", &self.refresh_expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// 身份提供方（负责用户认证并签发授权码/令牌）
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// 用授权码和 PKCE verifier 兑换令牌。
    ///
    /// IdP 拒绝 code/verifier 时返回 `AuthExchangeFailed`，
    /// 网络或 5xx 错误返回 `UpstreamUnavailable`。
    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenResponse, GateError>;

    /// refresh_token grant
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, GateError>;
}
