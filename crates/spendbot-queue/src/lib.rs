//! Durable job queue over Redis.
//!
//! This crate provides:
//! - A storage abstraction with Redis and in-memory backends
//! - Idempotent enqueue, atomic dequeue, retry scheduling and DLQ
//! - Recovery of jobs whose worker disappeared mid-run
//! - Sliding-window rate limiting with per-user and global scopes

pub mod config;
pub mod error;
pub mod memory_store;
pub mod queue;
pub mod rate_limit;
pub mod redis_store;
pub mod store;

pub use config::QueueConfig;
pub use error::{QueueError, QueueResult};
pub use memory_store::MemoryStore;
pub use queue::{Completion, JobQueue};
pub use rate_limit::{DualScopeLimiter, RateDecision, RateLimitConfig, SlidingWindowLimiter};
pub use redis_store::RedisStore;
pub use store::{SharedStore, Store, WindowSpec, WindowState, WriteOp};
