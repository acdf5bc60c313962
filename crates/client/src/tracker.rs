//! Public facade tying submission, polling and the registry together.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use jobwatch_auth::{Credential, CredentialStore};
use jobwatch_core::JobHandle;

use crate::config::ClientConfig;
use crate::poller::{Poller, TrackerEvent};
use crate::registry::{JobRegistry, JobSnapshot};
use crate::stream::JobStream;
use crate::submit::{JobPayload, JobSubmitter, SubmissionError, SubmitOptions};
use crate::transport::{BackendError, HttpBackend, ReqwestBackend, Transport};

/// Client-side job tracker.
///
/// Create one per session, call [`JobTracker::start`] from inside a tokio
/// runtime, and [`JobTracker::shutdown`] when done.
pub struct JobTracker {
    config: ClientConfig,
    credentials: Arc<CredentialStore>,
    registry: Arc<JobRegistry>,
    submitter: JobSubmitter,
    poller: Poller,
}

impl JobTracker {
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let transport = Arc::new(Transport::new(
            backend,
            Arc::clone(&credentials),
            config.transport_config(),
        ));
        let submitter = JobSubmitter::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            config.submit_retry.clone(),
        );
        let poller = Poller::new(transport, Arc::clone(&registry), config.poller_config());

        Self {
            config,
            credentials,
            registry,
            submitter,
            poller,
        }
    }

    /// Tracker backed by `reqwest`.
    pub fn from_config(
        config: ClientConfig,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, BackendError> {
        let backend = ReqwestBackend::new()?;
        Ok(Self::new(config, Arc::new(backend), credentials))
    }

    /// Start the background supervisor.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        self.poller.start()
    }

    pub async fn submit_job(&self, payload: JobPayload) -> Result<JobHandle, SubmissionError> {
        self.submit_job_with(payload, SubmitOptions::default()).await
    }

    pub async fn submit_job_with(
        &self,
        payload: JobPayload,
        options: SubmitOptions,
    ) -> Result<JobHandle, SubmissionError> {
        self.submitter.submit(payload, options).await
    }

    /// Watch `handle`. Never fails: unknown handles are registered first.
    ///
    /// All observers of one handle share a single poll loop.
    pub fn observe_job(&self, handle: &JobHandle) -> JobStream {
        self.registry.register(handle.clone(), None);
        let Some(subscription) = self.registry.subscribe(handle) else {
            // Cleared between register and subscribe (concurrent logout).
            return JobStream::lost(
                handle.clone(),
                "job no longer tracked",
                Arc::clone(&self.registry),
                self.poller.clone(),
            );
        };
        self.poller.ensure_polling(handle);
        JobStream::new(
            handle.clone(),
            subscription,
            Arc::clone(&self.registry),
            self.poller.clone(),
        )
    }

    /// Stop observing. Same as dropping the stream.
    pub fn cancel_observation(&self, stream: JobStream) {
        tracing::debug!(job = %stream.handle(), "observation cancelled");
        drop(stream);
    }

    pub fn poll_now(&self, handle: &JobHandle) -> bool {
        self.poller.poll_now(handle)
    }

    pub fn status(&self, handle: &JobHandle) -> Option<JobSnapshot> {
        self.registry.get(handle)
    }

    pub fn events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.poller.subscribe_events()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn login(&self, credential: Credential) {
        self.credentials.set(credential);
    }

    /// End the session: forget the credential and every tracked job.
    pub fn logout(&self) {
        tracing::info!("logging out; clearing tracked jobs");
        self.credentials.clear();
        self.poller.stop_all();
        self.registry.clear();
    }

    /// Stop all polling immediately. Open streams end without a final event.
    pub fn shutdown(&self) {
        self.poller.shutdown();
        self.registry.disconnect_all();
    }
}
