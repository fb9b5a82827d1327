pub mod gateway;
pub mod loader;

pub use gateway::{
    GatewayConfig, IdentityConfig, InternalConfig, JwtConfig, LoggingConfig, MetricsConfig,
    PermissionConfig, PolicyConfig, RateLimitConfig, RedisConfig, RetryConfig, ServerConfig,
    SessionConfig, UpstreamRoute,
};
pub use loader::ConfigLoader;
