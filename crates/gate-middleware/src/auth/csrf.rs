use gate_core::{GateError, Result};
use tracing::{trace, warn};

/// 任意一个存在即视为通过；跨站表单提交无法附加这些头
pub const CSRF_HEADERS: [&str; 3] = ["X-XSRF-TOKEN", "X-Requested-With", "X-CSRF-TOKEN"];

const MUTATING_METHODS: [&str; 4] = ["POST", "PUT", "DELETE", "PATCH"];

/// 会话 cookie 会被浏览器自动附带，有副作用的请求还必须带上自定义头
#[derive(Debug, Clone)]
pub struct CsrfGuard {
    enabled: bool,
    exempt_paths: Vec<String>,
}

impl CsrfGuard {
    pub fn new(exempt_paths: Vec<String>) -> Self {
        Self {
            enabled: true,
            exempt_paths: exempt_paths
                .into_iter()
                .map(|p| p.trim_end_matches('/').to_string())
                .collect(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            exempt_paths: Vec::new(),
        }
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .map_or(false, |rest| rest.starts_with('/'))
        })
    }

    pub fn check(&self, method: &str, path: &str, has_csrf_header: bool) -> Result<()> {
        if !self.enabled || !MUTATING_METHODS.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return Ok(());
        }
        if self.is_exempt(path) {
            trace!(path, "CSRF check skipped for exempt path");
            return Ok(());
        }
        if has_csrf_header {
            return Ok(());
        }

        warn!(method, path, "CSRF check failed: missing protection header");
        Err(GateError::CsrfRejected(format!("{} {}", method, path)))
    }
}
