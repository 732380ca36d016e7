//! API module
//!
//! HTTP API endpoints and shared state.

pub mod routes;

pub use routes::{create_router, AppState};
