pub mod bucket;
pub mod permission;
pub mod policy;
pub mod session;

pub use bucket::RateLimitBucket;
pub use permission::PermissionCacheEntry;
pub use policy::EndpointProtectionRule;
pub use session::{short_session_id, IssuedTokens, Session};
