//! Job creation: `POST /jobs` and immediate registration of the handle.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use jobwatch_core::{JobHandle, JobStatus};

use crate::registry::JobRegistry;
use crate::retry::{RetryPolicy, with_retry_logged};
use crate::transport::{ApiRequest, BinaryPayload, RequestBody, Transport, TransportError};
use crate::wire;

/// Header carrying the client-generated de-duplication key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Default collection endpoint for new jobs.
pub const DEFAULT_SUBMIT_PATH: &str = "/jobs";

/// Work to submit.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    /// Textual input, sent as a JSON body.
    Json(Value),
    /// Binary input (audio), sent as a multipart form.
    Binary(BinaryPayload),
}

impl JobPayload {
    fn into_body(self) -> RequestBody {
        match self {
            JobPayload::Json(value) => RequestBody::Json(value),
            JobPayload::Binary(payload) => RequestBody::Multipart(payload),
        }
    }
}

/// Per-submission options.
///
/// Without an idempotency key, submission is at-least-once: a retried POST
/// whose first attempt reached the backend may create a second job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub idempotency_key: Option<String>,
}

impl SubmitOptions {
    pub fn with_idempotency_key(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
        }
    }

    /// Options carrying a freshly generated (UUIDv7) key.
    pub fn generated() -> Self {
        Self::with_idempotency_key(Uuid::now_v7().to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed submission response: {0}")]
    MalformedResponse(String),
}

/// Submits jobs and registers their handles.
pub struct JobSubmitter {
    transport: Arc<Transport>,
    registry: Arc<JobRegistry>,
    policy: RetryPolicy,
    path: String,
}

impl JobSubmitter {
    pub fn new(transport: Arc<Transport>, registry: Arc<JobRegistry>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            registry,
            policy,
            path: DEFAULT_SUBMIT_PATH.to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Create a job. The handle is registered as `Pending 0%` before it is
    /// returned, so it is trackable the moment the caller sees it.
    pub async fn submit(
        &self,
        payload: JobPayload,
        options: SubmitOptions,
    ) -> Result<JobHandle, SubmissionError> {
        let mut request = ApiRequest::post(self.path.clone(), payload.into_body());
        if let Some(key) = &options.idempotency_key {
            request = request.with_header(IDEMPOTENCY_HEADER, key.clone());
        }

        let transport = &self.transport;
        let request = &request;
        let response = with_retry_logged(&self.policy, "submit job", move |_| {
            transport.send(request.clone())
        })
        .await?;

        let (handle, status_url) = wire::parse_submission(&response.body)
            .map_err(|e| SubmissionError::MalformedResponse(e.to_string()))?;

        self.registry
            .register_with_status(handle.clone(), status_url, JobStatus::pending());
        tracing::info!(job = %handle, "job submitted");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockReply};
    use crate::transport::{Method, TransportConfig};
    use jobwatch_auth::CredentialStore;
    use serde_json::json;
    use std::time::Duration;

    fn submitter(backend: &Arc<MockBackend>, registry: &Arc<JobRegistry>, attempts: u32) -> JobSubmitter {
        let transport = Transport::new(
            backend.clone(),
            Arc::new(CredentialStore::new()),
            TransportConfig {
                base_url: "http://api.test".into(),
                default_timeout: Duration::from_secs(5),
                upload_timeout: Duration::from_secs(50),
            },
        );
        JobSubmitter::new(
            Arc::new(transport),
            registry.clone(),
            RetryPolicy::exponential(attempts, Duration::from_millis(100), 2.0),
        )
    }

    #[tokio::test]
    async fn text_jobs_are_posted_as_json_and_registered_pending() {
        let backend = Arc::new(MockBackend::new());
        backend.push(Method::Post, "/jobs", MockReply::json(201, json!({"id": "7", "statusUrl": "/jobs/7/status"})));
        let registry = Arc::new(JobRegistry::new());

        let handle = submitter(&backend, &registry, 2)
            .submit(JobPayload::Json(json!({"text": "notes"})), SubmitOptions::default())
            .await
            .unwrap();

        assert_eq!(handle.as_str(), "7");
        let snapshot = registry.get(&handle).unwrap();
        assert_eq!(snapshot.status, JobStatus::pending());
        assert_eq!(snapshot.status_path, "/jobs/7/status");

        let sent = backend.requests();
        assert_eq!(sent[0].body, RequestBody::Json(json!({"text": "notes"})));
        assert_eq!(sent[0].header(IDEMPOTENCY_HEADER), None);
    }

    #[tokio::test(start_paused = true)]
    async fn idempotency_key_is_repeated_on_every_attempt() {
        let backend = Arc::new(MockBackend::new());
        backend.push(Method::Post, "/jobs", MockReply::json(503, json!({"detail": "busy"})));
        backend.push(Method::Post, "/jobs", MockReply::json(201, json!({"id": 9})));
        let registry = Arc::new(JobRegistry::new());

        submitter(&backend, &registry, 2)
            .submit(JobPayload::Json(json!({})), SubmitOptions::with_idempotency_key("k-1"))
            .await
            .unwrap();

        let keys: Vec<_> = backend
            .requests()
            .iter()
            .map(|r| r.header(IDEMPOTENCY_HEADER).map(str::to_string))
            .collect();
        assert_eq!(keys, vec![Some("k-1".to_string()), Some("k-1".to_string())]);
    }

    #[tokio::test]
    async fn validation_errors_surface_verbatim_without_retry() {
        let backend = Arc::new(MockBackend::new());
        backend.push(Method::Post, "/jobs", MockReply::json(422, json!({"detail": "unsupported format"})));
        let registry = Arc::new(JobRegistry::new());

        let err = submitter(&backend, &registry, 3)
            .submit(JobPayload::Json(json!({})), SubmitOptions::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SubmissionError::Transport(TransportError::Validation {
                status: 422,
                message: "unsupported format".into()
            })
        );
        assert_eq!(backend.request_count(Method::Post, "/jobs"), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn response_without_id_is_malformed() {
        let backend = Arc::new(MockBackend::new());
        backend.push(Method::Post, "/jobs", MockReply::json(200, json!({"ok": true})));
        let registry = Arc::new(JobRegistry::new());

        let err = submitter(&backend, &registry, 1)
            .submit(JobPayload::Json(json!({})), SubmitOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SubmissionError::MalformedResponse(_)));
    }

    #[test]
    fn generated_keys_are_unique() {
        assert_ne!(SubmitOptions::generated(), SubmitOptions::generated());
    }
}
