pub mod identity;
pub mod origin;

pub use identity::{IdentityProvider, TokenResponse};
pub use origin::{PermissionOrigin, PolicySource};
