//! `jobwatch-client`
//!
//! **Responsibility:** resilient client-side tracking of long-running backend
//! jobs (transcription, summarization).
//!
//! This crate provides:
//! - A transport with auth injection, timeout policy and typed error classification
//! - Exponential-backoff retries
//! - Job submission (JSON or multipart)
//! - A coalescing poll scheduler and an in-memory job registry
//!
//! UI layers use [`JobTracker`]: `submit_job`, `observe_job`, `cancel_observation`.

pub mod config;
pub mod mock;
pub mod poller;
pub mod registry;
pub mod retry;
pub mod stream;
pub mod submit;
pub mod tracker;
pub mod transport;
pub mod wire;

pub use config::{ClientConfig, ConfigError};
pub use poller::{PollCommand, PollMode, Poller, PollerConfig, TrackerEvent};
pub use registry::{ApplyOutcome, JobEvent, JobRegistry, JobSnapshot};
pub use retry::{RetryAttempt, RetryPolicy, Retryable, with_retry, with_retry_logged};
pub use stream::JobStream;
pub use submit::{JobPayload, JobSubmitter, SubmissionError, SubmitOptions};
pub use tracker::JobTracker;
pub use transport::{ApiRequest, ApiResponse, BinaryPayload, Transport, TransportError};
