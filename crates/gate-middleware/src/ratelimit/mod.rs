pub mod limiter;
pub mod store;
pub mod strategy;
pub mod token_bucket;

pub use limiter::{LimiterBackend, RateLimitDecision, RateLimiter};
pub use store::{MemoryBucketStore, SharedBucketStore};
pub use strategy::{BucketParams, ClientKey, RateLimitTier, TierLimits};
pub use token_bucket::{TakeOutcome, TokenBucket};

#[cfg(feature = "redis-store")]
pub use store::RedisBucketStore;
