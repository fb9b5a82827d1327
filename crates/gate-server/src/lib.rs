pub mod api;
pub mod clients;
pub mod cookie;
pub mod error;
pub mod metrics;
pub mod state;

pub use api::create_router;
pub use error::ApiError;
pub use state::{AppState, Collaborators, SharedBackends};
