//! HTTP surface: routes, handlers, shared state and error mapping.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiErrorResponse};
pub use routes::build_router;
pub use state::AppState;
