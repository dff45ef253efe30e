//! Job processing worker.
//!
//! This crate provides:
//! - Circuit breaker guarding the AI provider
//! - Per-kind job handlers over a pluggable provider
//! - Single-job processing with retry/DLQ classification and telemetry
//! - Worker pool with retry scheduling and graceful shutdown

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod metrics;
pub mod processor;
pub mod provider;
pub mod telemetry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{ResultStoreKind, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use handlers::{HandlerError, HandlerRegistry, JobHandler};
pub use processor::{JobProcessor, ProcessOutcome, CIRCUIT_OPEN_ERROR};
pub use provider::{HttpProvider, Provider, ProviderConfig, ProviderError, ProviderRequest};
pub use telemetry::{AttemptOutcome, JobEvent, TelemetrySink, TracingTelemetry};
