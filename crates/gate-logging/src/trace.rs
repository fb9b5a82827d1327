use rand::Rng;
use tracing::Span;

/// 请求追踪 ID 的传播头
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

const MAX_TRACE_ID_LEN: usize = 128;

/// 生成 32 位十六进制的 trace id
pub fn generate_trace_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:032x}", rng.gen::<u128>())
}

/// 复用客户端带来的 trace id；缺失或含非法字符时重新生成
pub fn accept_or_generate(incoming: Option<&str>) -> String {
    match incoming.map(str::trim) {
        Some(id)
            if !id.is_empty()
                && id.len() <= MAX_TRACE_ID_LEN
                && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
        {
            id.to_string()
        }
        _ => generate_trace_id(),
    }
}

/// 每个请求一个 span，所有下游日志都带上 trace_id
pub fn request_span(trace_id: &str, method: &str, path: &str) -> Span {
    tracing::info_span!("request", trace_id = %trace_id, method = %method, path = %path)
}
