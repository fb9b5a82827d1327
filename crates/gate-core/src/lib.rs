pub mod entity;
pub mod error;
pub mod retry;
pub mod traits;

pub use entity::{EndpointProtectionRule, IssuedTokens, PermissionCacheEntry, RateLimitBucket, Session};
pub use error::{GateError, Result};
pub use retry::{retry, RetryPolicy};
pub use traits::{IdentityProvider, PermissionOrigin, PolicySource, TokenResponse};
