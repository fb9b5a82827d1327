use axum::http::{header, HeaderMap};

pub const SESSION_COOKIE: &str = "SESSION_ID";
pub const SESSION_HEADER: &str = "X-Session-Id";

/// 会话 id：`SESSION_ID` cookie 优先，其次 `X-Session-Id` 头
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
        });

    from_cookie.or_else(|| {
        headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

pub fn session_cookie(session_id: &str, max_age_secs: u64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE, session_id, max_age_secs
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn clear_session_cookie(secure: bool) -> String {
    session_cookie("", 0, secure)
}

/// 去掉 Cookie 头中的 `SESSION_ID`，其余 cookie 原样保留
pub fn strip_session_cookie(cookie_header: &str) -> Option<String> {
    let rest: Vec<&str> = cookie_header
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split_once('=').map(|(name, _)| name) != Some(SESSION_COOKIE))
        .collect();

    if rest.is_empty() {
        None
    } else {
        Some(rest.join("; "))
    }
}
