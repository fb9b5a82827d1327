use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("Unknown log format: {0}")]
    UnknownFormat(String),

    #[error("Failed to install subscriber: {0}")]
    InitError(String),
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    // RUST_LOG 优先于配置文件
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidFilter(level.to_string(), e.to_string()))
}

/// 安装全局 tracing subscriber
///
/// 只能成功调用一次，重复调用返回 `InitError`。
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), LoggingError> {
    let filter = build_filter(level)?;

    let result = match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(false)
            .try_init(),
    };

    result.map_err(|e| LoggingError::InitError(e.to_string()))
}
