pub mod manager;
pub mod pending;
pub mod store;

pub use manager::SessionManager;
pub use pending::{MemoryPendingLoginStore, PendingLoginStore};
pub use store::{MemorySessionStore, SessionStore};

#[cfg(feature = "redis-store")]
pub use pending::RedisPendingLoginStore;
#[cfg(feature = "redis-store")]
pub use store::RedisSessionStore;
