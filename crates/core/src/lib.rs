//! `jobwatch-core`: domain foundation for client-side job tracking.
//!
//! This crate contains **pure domain** types (no I/O, no async runtime):
//! job handles, the closed job state machine, and the status value object
//! that the client replaces wholesale on every poll.

pub mod error;
pub mod id;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::JobHandle;
pub use status::{JobState, JobStatus};
