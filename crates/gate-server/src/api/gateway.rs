//! 网关入口：为每个请求跑准入流水线，通过后转发到上游

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
};
use gate_config::UpstreamRoute;
use gate_core::GateError;
use gate_logging::{accept_or_generate, request_span, TRACE_ID_HEADER};
use gate_middleware::auth::CSRF_HEADERS;
use gate_middleware::{GateContext, RequestInfo};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

use crate::cookie;
use crate::error::ApiError;
use crate::metrics::record_upstream_duration;
use crate::AppState;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const AUTHZ_PERM_HEADER: &str = "X-AuthZ-Perm";
pub const RATE_LIMIT_LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RATE_LIMIT_BACKEND_HEADER: &str = "X-RateLimit-Backend";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// 限流使用的客户端地址
///
/// 默认取连接对端地址。只有对端在 `trusted_proxies` 中时才读取 `X-Forwarded-For`，
/// 从右往左跳过受信代理，取第一个不受信的地址。
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted_proxies: &[IpAddr]) -> String {
    let Some(peer) = peer.map(|addr| addr.ip()) else {
        return "unknown".to_string();
    };
    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect();

    let mut client = peer;
    for hop in hops.into_iter().rev() {
        match hop.parse::<IpAddr>() {
            Ok(ip) => {
                client = ip;
                if !trusted_proxies.contains(&ip) {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    client.to_string()
}

pub fn has_csrf_header(headers: &HeaderMap) -> bool {
    CSRF_HEADERS.iter().any(|name| headers.contains_key(*name))
}

// 只解码会改变路径结构的转义：`.`、`/`、`\`
fn decode_structural_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find(|c: char| c == '%' || c == '\\') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        if tail.starts_with('\\') {
            out.push('/');
            rest = &tail[1..];
            continue;
        }
        match tail.get(1..3).map(|hex| hex.to_ascii_lowercase()).as_deref() {
            Some("2e") => {
                out.push('.');
                rest = &tail[3..];
            }
            Some("2f") | Some("5c") => {
                out.push('/');
                rest = &tail[3..];
            }
            _ => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// 规范化请求路径：解析 `.`/`..`、折叠重复的 `/`
///
/// 授权判定和转发都使用同一个规范化结果；越过根目录的路径被拒绝。
pub fn normalize_path(raw: &str) -> Result<String, GateError> {
    let decoded = decode_structural_escapes(raw);
    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(GateError::BadRequest(format!("path escapes root: {}", raw)));
                }
            }
            other => segments.push(other),
        }
    }

    let mut path = String::with_capacity(decoded.len());
    for segment in &segments {
        path.push('/');
        path.push_str(segment);
    }
    if path.is_empty() {
        path.push('/');
    } else if decoded.ends_with('/') {
        path.push('/');
    }
    Ok(path)
}

/// 最长前缀匹配；前缀必须落在路径段边界上
pub fn match_upstream<'a>(routes: &'a [UpstreamRoute], path: &str) -> Option<&'a UpstreamRoute> {
    routes
        .iter()
        .filter(|route| {
            let prefix = route.prefix.trim_end_matches('/');
            prefix.is_empty()
                || path == prefix
                || path
                    .strip_prefix(prefix)
                    .map_or(false, |rest| rest.starts_with('/'))
        })
        .max_by_key(|route| route.prefix.trim_end_matches('/').len())
}

fn upstream_url(route: &UpstreamRoute, path: &str, query: Option<&str>) -> String {
    let forwarded_path = if route.strip_prefix {
        let rest = path.strip_prefix(route.prefix.trim_end_matches('/')).unwrap_or(path);
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        }
    } else {
        path.to_string()
    };

    let mut url = format!("{}{}", route.url.trim_end_matches('/'), forwarded_path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// 上游请求头：去掉逐跳头和客户端伪造的身份头，补上网关注入的头
fn upstream_headers(incoming: &HeaderMap, ctx: &GateContext, trace_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if is_hop_by_hop(name)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == header::COOKIE
            || name.as_str().eq_ignore_ascii_case(USER_ID_HEADER)
            || name.as_str().eq_ignore_ascii_case(AUTHZ_PERM_HEADER)
            || name.as_str().eq_ignore_ascii_case(TRACE_ID_HEADER)
            || name.as_str().eq_ignore_ascii_case(cookie::SESSION_HEADER)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let cookies: Vec<String> = incoming
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(cookie::strip_session_cookie)
        .collect();
    if let Ok(value) = HeaderValue::from_str(&cookies.join("; ")) {
        if !cookies.is_empty() {
            headers.insert(header::COOKIE, value);
        }
    }

    if let Some(session) = &ctx.session {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", session.access_token)) {
            headers.insert(header::AUTHORIZATION, value);
        }
        if let Ok(value) = HeaderValue::from_str(&session.user_id) {
            headers.insert(USER_ID_HEADER, value);
        }
    }
    if let Some(code) = &ctx.checked_permission {
        if let Ok(value) = HeaderValue::from_str(code) {
            headers.insert(AUTHZ_PERM_HEADER, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        headers.insert(TRACE_ID_HEADER, value);
    }
    headers
}

async fn forward(
    state: &AppState,
    ctx: &GateContext,
    method: Method,
    request: &RequestInfo,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, GateError> {
    let Some(route) = match_upstream(&state.config.upstreams, &request.path) else {
        return Err(GateError::NotFound(format!("no upstream for {}", request.path)));
    };
    let url = upstream_url(route, &request.path, query);

    let started = Instant::now();
    let upstream = state
        .http
        .request(method, &url)
        .headers(upstream_headers(headers, ctx, &request.trace_id))
        .body(body)
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(upstream = %route.prefix, error = %e, "Upstream request failed");
            GateError::UpstreamUnavailable(format!("upstream {} unreachable", route.prefix))
        })?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) && *name != header::CONTENT_LENGTH {
            response_headers.append(name.clone(), value.clone());
        }
    }
    let bytes = upstream.bytes().await.map_err(|e| {
        tracing::warn!(upstream = %route.prefix, error = %e, "Failed to read upstream response");
        GateError::UpstreamUnavailable(format!("upstream {} response interrupted", route.prefix))
    })?;
    record_upstream_duration(started.elapsed().as_secs_f64());

    tracing::debug!(upstream = %route.prefix, status = status.as_u16(), "Forwarded request");
    Ok((status, response_headers, bytes).into_response())
}

fn apply_gate_headers(response: &mut Response, ctx: &GateContext, trace_id: &str, admitted: bool) {
    let headers = response.headers_mut();
    if let Some(decision) = &ctx.rate_limit {
        headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(decision.remaining));
        if admitted {
            headers.insert(
                RATE_LIMIT_BACKEND_HEADER,
                HeaderValue::from_static(decision.backend.as_str()),
            );
        }
    }
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        headers.insert(TRACE_ID_HEADER, value);
    }
}

/// 未匹配到显式路由的所有请求
pub async fn gate(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = accept_or_generate(headers.get(TRACE_ID_HEADER).and_then(|v| v.to_str().ok()));
    let span = request_span(&trace_id, method.as_str(), uri.path());

    async move {
        let path = match normalize_path(uri.path()) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected malformed path");
                let mut response = ApiError(e).into_response();
                apply_gate_headers(&mut response, &GateContext::default(), &trace_id, false);
                return response;
            }
        };

        let request = RequestInfo {
            method: method.to_string(),
            path,
            client_ip: client_ip(
                &headers,
                connect.map(|ConnectInfo(addr)| addr),
                &state.config.ratelimit.trusted_proxies,
            ),
            session_id: cookie::session_id(&headers),
            trace_id: trace_id.clone(),
            csrf_header: has_csrf_header(&headers),
        };

        let (ctx, outcome) = state.pipeline.run(&request).await;
        let (mut response, admitted) = match outcome {
            Ok(()) => match forward(&state, &ctx, method, &request, uri.query(), &headers, body).await {
                Ok(response) => (response, true),
                Err(e) => (ApiError(e).into_response(), true),
            },
            Err(e) => {
                tracing::info!(user_id = ctx.user_id().unwrap_or("-"), error_kind = e.kind(), "Request rejected");
                (ApiError(e).into_response(), false)
            }
        };

        apply_gate_headers(&mut response, &ctx, &trace_id, admitted);
        response
    }
    .instrument(span)
    .await
}
