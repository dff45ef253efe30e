//! Result storage for processed jobs.
//!
//! Handlers produce a JSON document per successful job. It is written to a
//! [`ResultStore`] under `results/{user_id}/{job_id}.json` and the returned
//! reference is recorded on the job as `result_ref`.

pub mod error;
pub mod local;
pub mod r2;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use local::LocalResultStore;
pub use r2::{R2Config, R2ResultStore};
pub use store::{result_path, validate_key, ResultStore, SharedResultStore};
