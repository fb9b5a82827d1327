use chrono::{DateTime, Utc};
use gate_core::{retry, GateError, IdentityProvider, IssuedTokens, Result, RetryPolicy, Session, TokenResponse};
use metrics::increment_counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::jwt::{AccessClaims, TokenValidator};
use crate::session::SessionManager;

/// 令牌兑换协调器
///
/// 负责授权码兑换、会话创建以及 access token 的透明刷新。
pub struct TokenExchangeCoordinator {
    identity: Arc<dyn IdentityProvider>,
    validator: TokenValidator,
    sessions: Arc<SessionManager>,
    retry: RetryPolicy,
    refresh_margin: chrono::Duration,
    default_refresh_ttl: chrono::Duration,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenExchangeCoordinator {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        validator: TokenValidator,
        sessions: Arc<SessionManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            identity,
            validator,
            sessions,
            retry,
            refresh_margin: chrono::Duration::seconds(30),
            default_refresh_ttl: chrono::Duration::days(30),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_refresh_margin(mut self, margin: std::time::Duration) -> Self {
        self.refresh_margin = chrono::Duration::from_std(margin).unwrap_or(self.refresh_margin);
        self
    }

    pub fn with_default_refresh_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.default_refresh_ttl = chrono::Duration::from_std(ttl).unwrap_or(self.default_refresh_ttl);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// 用授权码 + verifier 兑换令牌并创建会话
    pub async fn exchange(&self, code: &str, code_verifier: &str) -> Result<Session> {
        if code.is_empty() || code_verifier.is_empty() {
            return Err(GateError::AuthExchangeFailed("missing code or verifier".to_string()));
        }

        let identity = &self.identity;
        let response = retry(&self.retry, "idp.exchange_code", move || {
            identity.exchange_code(code, code_verifier)
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "Authorization code exchange failed");
            e
        })?;

        self.create_from_tokens(response).await
    }

    /// 校验 IdP 返回的令牌并持久化新会话
    pub async fn create_from_tokens(&self, response: TokenResponse) -> Result<Session> {
        let now = Utc::now();
        let claims = self.validator.validate(&response.access_token)?;
        let tokens = self.issued_tokens(response, &claims, now)?;

        let session = Session::new(
            uuid::Uuid::new_v4().to_string(),
            claims.sub.clone(),
            claims.preferred_username.clone(),
            tokens,
            now,
        )
        .with_email(claims.email.clone())
        .with_tier(claims.tier.clone());

        self.sessions.create(&session).await?;
        increment_counter!("gate_sessions_created_total");
        Ok(session)
    }

    fn issued_tokens(&self, response: TokenResponse, claims: &AccessClaims, now: DateTime<Utc>) -> Result<IssuedTokens> {
        // exp claim 为准；expires_in 只是 IdP 的提示
        let access_token_expires_at = claims.expires_at()?;
        let refresh_token_expires_at = match response.refresh_expires_in {
            Some(secs) if secs > 0 => now + chrono::Duration::seconds(secs as i64),
            _ => now + self.default_refresh_ttl,
        };

        Ok(IssuedTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            access_token_expires_at,
            refresh_token_expires_at,
        })
    }

    /// 确保 access token 仍在有效期外的安全边界内，必要时刷新
    pub async fn ensure_fresh(&self, session: Session) -> Result<Session> {
        let now = Utc::now();
        if !session.needs_refresh(now, self.refresh_margin) {
            return Ok(session);
        }
        self.refresh_inner(session, false).await
    }

    /// 强制刷新（`POST /auth/refresh`）
    ///
    /// 并发调用时只有一次真正访问 IdP，其余调用返回同一个新版本。
    pub async fn force_refresh(&self, session: Session) -> Result<Session> {
        self.refresh_inner(session, true).await
    }

    async fn refresh_inner(&self, observed: Session, force: bool) -> Result<Session> {
        let lock = self.refresh_lock(&observed.session_id);
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(&observed, force).await
        };
        self.release_refresh_lock(&observed.session_id, &lock);

        match &result {
            Ok(_) => increment_counter!("gate_token_refresh_total", "result" => "ok"),
            Err(GateError::SessionExpired(_)) => increment_counter!("gate_token_refresh_total", "result" => "expired"),
            Err(_) => increment_counter!("gate_token_refresh_total", "result" => "error"),
        }
        result
    }

    async fn refresh_locked(&self, observed: &Session, force: bool) -> Result<Session> {
        let now = Utc::now();
        let Some(current) = self.sessions.load_raw(&observed.session_id).await? else {
            return Err(GateError::SessionExpired("session not found".to_string()));
        };

        // 等锁期间已有其他请求完成了刷新
        if current.version != observed.version {
            debug!(
                session_id = %current.short_id(),
                observed_version = observed.version,
                current_version = current.version,
                "Session already refreshed by a concurrent request"
            );
            return Ok(current);
        }
        if !force && !current.needs_refresh(now, self.refresh_margin) {
            return Ok(current);
        }

        if current.is_refresh_token_expired(now) {
            self.invalidate(&current, "refresh token expired").await;
            return Err(GateError::SessionExpired("refresh token expired".to_string()));
        }
        let Some(refresh_token) = current.refresh_token.clone() else {
            self.invalidate(&current, "no refresh token").await;
            return Err(GateError::SessionExpired("no refresh token".to_string()));
        };

        let identity = &self.identity;
        let token = refresh_token.as_str();
        let response = match retry(&self.retry, "idp.refresh", move || identity.refresh(token)).await {
            Ok(response) => response,
            Err(GateError::AuthExchangeFailed(reason)) | Err(GateError::InvalidToken(reason)) => {
                // IdP 拒绝 refresh token：会话作废，客户端需重新登录
                self.invalidate(&current, &reason).await;
                return Err(GateError::SessionExpired(reason));
            }
            Err(e) => return Err(e),
        };

        let claims = self.validator.validate(&response.access_token)?;
        let tokens = self.issued_tokens(response, &claims, now)?;
        let next = current
            .rotate(tokens, now)
            .with_tier(claims.tier.or(current.tier.clone()));

        if self.sessions.replace(current.version, &next).await? {
            info!(
                session_id = %next.short_id(),
                user_id = %next.user_id,
                version = next.version,
                "Access token refreshed"
            );
            return Ok(next);
        }

        // 另一个网关实例抢先写入：以存储中的版本为准
        match self.sessions.load_raw(&observed.session_id).await? {
            Some(stored) => Ok(stored),
            None => Err(GateError::SessionExpired("session removed during refresh".to_string())),
        }
    }

    async fn invalidate(&self, session: &Session, reason: &str) {
        warn!(session_id = %session.short_id(), user_id = %session.user_id, reason, "Invalidating session");
        if let Err(e) = self.sessions.delete(&session.session_id).await {
            warn!(session_id = %session.short_id(), error = %e, "Failed to delete invalidated session");
        }
    }

    fn refresh_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_refresh_lock(&self, session_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        // 只剩 map 和当前调用者持有时才移除
        if Arc::strong_count(lock) <= 2 {
            locks.remove(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use async_trait::async_trait;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const SECRET: &str = "test-secret";

    fn access_token(user: &str, exp_offset_secs: i64) -> String {
        let claims = AccessClaims {
            sub: user.to_string(),
            preferred_username: Some("alice".to_string()),
            email: Some("alice@example.com".to_string()),
            tier: None,
            exp: Utc::now().timestamp() + exp_offset_secs,
            iat: None,
            iss: None,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    struct FakeIdp {
        exchanges: AtomicU32,
        refreshes: AtomicU32,
        reject_refresh: bool,
        rotate_refresh_token: bool,
    }

    impl FakeIdp {
        fn new() -> Self {
            Self {
                exchanges: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
                reject_refresh: false,
                rotate_refresh_token: true,
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for FakeIdp {
        async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenResponse> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if code != "good-code" || code_verifier != "good-verifier" {
                return Err(GateError::AuthExchangeFailed("invalid_grant".to_string()));
            }
            Ok(TokenResponse {
                access_token: access_token("user-1", 300),
                refresh_token: Some("refresh-1".to_string()),
                token_type: Some("Bearer".to_string()),
                expires_in: Some(300),
                refresh_expires_in: Some(1800),
                scope: None,
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.reject_refresh {
                return Err(GateError::AuthExchangeFailed("invalid_grant".to_string()));
            }
            Ok(TokenResponse {
                access_token: access_token("user-1", 300),
                refresh_token: self.rotate_refresh_token.then(|| format!("refresh-{}", n + 1)),
                token_type: None,
                expires_in: Some(300),
                refresh_expires_in: None,
                scope: None,
            })
        }
    }

    fn coordinator(idp: Arc<FakeIdp>) -> TokenExchangeCoordinator {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Duration::from_secs(3600),
        ));
        TokenExchangeCoordinator::new(
            idp,
            TokenValidator::hmac(SECRET),
            sessions,
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn test_exchange_creates_unique_sessions() {
        let idp = Arc::new(FakeIdp::new());
        let coordinator = coordinator(idp.clone());

        let a = coordinator.exchange("good-code", "good-verifier").await.unwrap();
        let b = coordinator.exchange("good-code", "good-verifier").await.unwrap();

        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.user_id, "user-1");
        assert_eq!(a.email.as_deref(), Some("alice@example.com"));
        assert!(coordinator.sessions().get(&a.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exchange_rejects_mismatched_verifier_without_retry() {
        let idp = Arc::new(FakeIdp::new());
        let coordinator = coordinator(idp.clone());

        let result = coordinator.exchange("good-code", "wrong-verifier").await;
        assert!(matches!(result, Err(GateError::AuthExchangeFailed(_))));
        assert_eq!(idp.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_token_never_accepted() {
        let coordinator = coordinator(Arc::new(FakeIdp::new()));
        let response = TokenResponse {
            access_token: "garbage".to_string(),
            refresh_token: None,
            token_type: None,
            expires_in: None,
            refresh_expires_in: None,
            scope: None,
        };

        assert!(matches!(
            coordinator.create_from_tokens(response).await,
            Err(GateError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_idempotent() {
        let idp = Arc::new(FakeIdp::new());
        let coordinator = Arc::new(coordinator(idp.clone()));

        let session = coordinator.exchange("good-code", "good-verifier").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let observed = session.clone();
            handles.push(tokio::spawn(async move { coordinator.force_refresh(observed).await }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(idp.refreshes.load(Ordering::SeqCst), 1);
        let first = &results[0];
        assert_eq!(first.version, session.version + 1);
        assert!(results.iter().all(|s| s.access_token == first.access_token && s.version == first.version));

        let stored = coordinator.sessions().get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token, first.refresh_token);
    }

    #[tokio::test]
    async fn test_fresh_session_is_not_refreshed() {
        let idp = Arc::new(FakeIdp::new());
        let coordinator = coordinator(idp.clone());

        let session = coordinator.exchange("good-code", "good-verifier").await.unwrap();
        let same = coordinator.ensure_fresh(session.clone()).await.unwrap();

        assert_eq!(same.version, session.version);
        assert_eq!(idp.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_refresh_token_invalidates_session() {
        let idp = Arc::new(FakeIdp::new());
        let coordinator = coordinator(idp.clone());

        let session = coordinator.exchange("good-code", "good-verifier").await.unwrap();
        let mut stale = session.clone();
        stale.access_token_expires_at = Utc::now() - chrono::Duration::seconds(10);
        stale.refresh_token_expires_at = Utc::now() - chrono::Duration::seconds(1);
        coordinator.sessions().replace(session.version, &stale).await.unwrap();

        let result = coordinator.ensure_fresh(stale).await;
        assert!(matches!(result, Err(GateError::SessionExpired(_))));
        assert!(coordinator.sessions().load_raw(&session.session_id).await.unwrap().is_none());
        assert_eq!(idp.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_invalidates_session() {
        let mut fake = FakeIdp::new();
        fake.reject_refresh = true;
        let idp = Arc::new(fake);
        let coordinator = coordinator(idp.clone());

        let session = coordinator.exchange("good-code", "good-verifier").await.unwrap();
        let result = coordinator.force_refresh(session.clone()).await;

        assert!(matches!(result, Err(GateError::SessionExpired(_))));
        assert!(coordinator.sessions().get(&session.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_keeps_refresh_expiry() {
        let mut fake = FakeIdp::new();
        fake.rotate_refresh_token = false;
        let idp = Arc::new(fake);
        let coordinator = coordinator(idp.clone());

        let session = coordinator.exchange("good-code", "good-verifier").await.unwrap();
        let refreshed = coordinator.force_refresh(session.clone()).await.unwrap();

        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(refreshed.refresh_token_expires_at, session.refresh_token_expires_at);
        assert_eq!(refreshed.version, session.version + 1);

        let stored = coordinator.sessions().load_raw(&session.session_id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token_expires_at, session.refresh_token_expires_at);
    }
}
