//! 外部协作方的 HTTP 客户端：身份提供方、策略源、权限源

use async_trait::async_trait;
use gate_config::{IdentityConfig, InternalConfig};
use gate_core::{EndpointProtectionRule, GateError, IdentityProvider, PermissionOrigin, PolicySource, Result, TokenResponse};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// 网关调用内部服务时携带的静态凭证头
pub const INTERNAL_API_KEY_HEADER: &str = "X-Internal-Api-Key";

fn unavailable(target: &str, err: reqwest::Error) -> GateError {
    tracing::warn!(target_service = target, error = %err, "Upstream call failed");
    GateError::UpstreamUnavailable(format!("{} unreachable", target))
}

fn with_internal_key(request: RequestBuilder, api_key: &Option<String>) -> RequestBuilder {
    match api_key {
        Some(key) => request.header(INTERNAL_API_KEY_HEADER, key),
        None => request,
    }
}

pub fn build_http_client(timeout: Duration) -> anyhow::Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// OAuth2 token 端点客户端
pub struct HttpIdentityProvider {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
}

impl HttpIdentityProvider {
    pub fn new(config: &IdentityConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(Duration::from_secs(config.timeout_secs))?,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
        })
    }

    async fn token_request<'a>(&'a self, mut form: Vec<(&'a str, &'a str)>) -> Result<TokenResponse> {
        form.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| unavailable("identity provider", e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GateError::UpstreamUnavailable(format!("identity provider returned {}", status)));
        }
        if !status.is_success() {
            return Err(GateError::AuthExchangeFailed(format!("identity provider returned {}", status)));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|_| GateError::AuthExchangeFailed("malformed token response".to_string()))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenResponse> {
        self.token_request(vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", code_verifier),
            ("redirect_uri", self.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.token_request(vec![("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await
    }
}

/// 策略源：`GET {base}/internal/policies`
pub struct HttpPolicySource {
    http: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpPolicySource {
    pub fn new(http: Client, base_url: &str, internal: &InternalConfig) -> Self {
        Self {
            http,
            url: format!("{}/internal/policies", base_url.trim_end_matches('/')),
            api_key: internal.api_key.clone(),
        }
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch_rules(&self) -> Result<Vec<EndpointProtectionRule>> {
        let response = with_internal_key(self.http.get(&self.url), &self.api_key)
            .send()
            .await
            .map_err(|e| unavailable("policy source", e))?;

        if !response.status().is_success() {
            return Err(GateError::UpstreamUnavailable(format!(
                "policy source returned {}",
                response.status()
            )));
        }

        response
            .json::<Vec<EndpointProtectionRule>>()
            .await
            .map_err(|e| GateError::UpstreamUnavailable(format!("malformed policy feed: {}", e)))
    }
}

#[derive(Deserialize)]
struct PermissionCheckResponse {
    granted: bool,
}

/// 权限源：`GET {base}/internal/permissions/check?userId=..&permissionCode=..`
pub struct HttpPermissionOrigin {
    http: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpPermissionOrigin {
    pub fn new(http: Client, base_url: &str, internal: &InternalConfig) -> Self {
        Self {
            http,
            url: format!("{}/internal/permissions/check", base_url.trim_end_matches('/')),
            api_key: internal.api_key.clone(),
        }
    }
}

#[async_trait]
impl PermissionOrigin for HttpPermissionOrigin {
    async fn has_permission(&self, user_id: &str, permission_code: &str) -> Result<bool> {
        let request = self
            .http
            .get(&self.url)
            .query(&[("userId", user_id), ("permissionCode", permission_code)]);
        let response = with_internal_key(request, &self.api_key)
            .send()
            .await
            .map_err(|e| unavailable("permission origin", e))?;

        match response.status() {
            // 未知用户或权限码
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => response
                .json::<PermissionCheckResponse>()
                .await
                .map(|body| body.granted)
                .map_err(|e| GateError::UpstreamUnavailable(format!("malformed permission response: {}", e))),
            status => Err(GateError::UpstreamUnavailable(format!("permission origin returned {}", status))),
        }
    }
}
