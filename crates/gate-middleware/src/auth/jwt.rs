use chrono::{DateTime, TimeZone, Utc};
use gate_core::{GateError, Result};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

/// IdP 签发的 access token 中网关关心的 claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// 订阅等级，如 `premium`
    #[serde(default)]
    pub tier: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub iss: Option<String>,
}

impl AccessClaims {
    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .ok_or_else(|| GateError::InvalidToken(format!("exp out of range: {}", self.exp)))
    }
}

/// access token 校验器（签名、issuer、过期时间）
#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// HMAC (HS256) 共享密钥
    pub fn hmac(secret: &str) -> Self {
        Self::with_key(Algorithm::HS256, DecodingKey::from_secret(secret.as_bytes()))
    }

    /// 按算法名和密钥材料构造；HS* 使用 `secret`，RS*/ES* 使用 PEM 公钥
    pub fn from_parts(algorithm: &str, secret: Option<&str>, public_key_pem: Option<&str>) -> Result<Self> {
        let algorithm = Algorithm::from_str(&algorithm.to_ascii_uppercase())
            .map_err(|e| GateError::Config(format!("jwt algorithm '{}': {}", algorithm, e)))?;

        let key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = secret.ok_or_else(|| GateError::Config("jwt secret missing".to_string()))?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let pem = public_key_pem.ok_or_else(|| GateError::Config("jwt public key missing".to_string()))?;
                DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| GateError::Config(e.to_string()))?
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                let pem = public_key_pem.ok_or_else(|| GateError::Config("jwt public key missing".to_string()))?;
                DecodingKey::from_ec_pem(pem.as_bytes()).map_err(|e| GateError::Config(e.to_string()))?
            }
            other => return Err(GateError::Config(format!("unsupported jwt algorithm: {:?}", other))),
        };

        Ok(Self::with_key(algorithm, key))
    }

    fn with_key(algorithm: Algorithm, key: DecodingKey) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        Self { key, validation }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.validation.leeway = leeway_secs;
        self
    }

    /// 校验并解析 access token；任何失败都是 `InvalidToken`
    pub fn validate(&self, token: &str) -> Result<AccessClaims> {
        let data = decode::<AccessClaims>(token, &self.key, &self.validation).map_err(|e| {
            let reason = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired".to_string(),
                ErrorKind::InvalidIssuer => "issuer mismatch".to_string(),
                ErrorKind::InvalidAudience => "audience mismatch".to_string(),
                ErrorKind::InvalidSignature => "signature mismatch".to_string(),
                _ => e.to_string(),
            };
            debug!(reason = %reason, "Access token rejected");
            GateError::InvalidToken(reason)
        })?;

        if data.claims.sub.is_empty() {
            return Err(GateError::InvalidToken("empty subject".to_string()));
        }

        Ok(data.claims)
    }
}
