//! Axum HTTP API for the job queue.
//!
//! This crate provides:
//! - Job submission with per-user and global rate limits
//! - Job status and cancellation
//! - Queue inspection for operators
//! - Health, readiness and Prometheus endpoints

pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
