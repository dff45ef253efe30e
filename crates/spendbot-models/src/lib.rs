//! Shared data models for the spendbot job-processing core.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, job kinds and lifecycle status
//! - Status snapshots and dead-letter entries
//! - An injectable time source

pub mod clock;
pub mod job;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use job::{DeadLetter, Job, JobId, JobKind, JobSnapshot, JobStatus, UnknownJobKind};
