pub mod csrf;
pub mod exchange;
pub mod jwt;
pub mod path_matcher;
pub mod permission;
pub mod pkce;
pub mod policy;

pub use csrf::{CsrfGuard, CSRF_HEADERS};
pub use exchange::TokenExchangeCoordinator;
pub use jwt::{AccessClaims, TokenValidator};
pub use permission::{MemorySharedPermissionCache, PermissionCache, SharedPermissionCache};
pub use policy::{PolicyCache, PolicyDecision, PolicySnapshot};

#[cfg(feature = "redis-store")]
pub use permission::RedisSharedPermissionCache;
