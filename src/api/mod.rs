//! HTTP surface: task submission, workflow control, health and `/ws`.

pub mod routes;

pub use routes::{AppState, api_routes};
