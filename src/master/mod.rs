//! Control plane: job management over the coordination store and the HTTP
//! API in front of it.

pub mod api;
pub mod manager;

pub use api::{router, run_api, ApiResponse, ApiState};
pub use manager::JobManager;
