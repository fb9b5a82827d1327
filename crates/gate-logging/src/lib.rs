pub mod subscriber;
pub mod trace;

pub use subscriber::{init_logging, LogFormat, LoggingError};
pub use trace::{accept_or_generate, generate_trace_id, request_span, TRACE_ID_HEADER};
