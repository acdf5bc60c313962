//! Status polling scheduler.
//!
//! One task per actively polled handle, driven by a command channel, plus a
//! supervisor task that handles idle-time discovery of out-of-band jobs.
//! Every task hangs off a root [`CancellationToken`] so [`Poller::shutdown`]
//! stops them all at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use jobwatch_core::{JobHandle, JobStatus};

use crate::registry::{ApplyOutcome, JobRegistry};
use crate::retry::{RetryPolicy, with_retry_logged};
use crate::transport::{ApiRequest, Transport, TransportError};
use crate::wire;

/// Message recorded on a job whose status endpoint answered `404`.
pub const NOT_FOUND_MESSAGE: &str = "job not found or expired";

const EVENT_CAPACITY: usize = 64;

/// Instruction for a per-handle poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCommand {
    /// Poll immediately; ignored while a fetch is in flight.
    PollNow,
    Stop,
}

/// Overall scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// At least one handle is polled on the short interval.
    Active,
    /// Nothing to poll; only discovery on the long interval.
    Idle,
    /// Empty registry or shut down.
    Stopped,
}

/// Tracker-wide notifications (not tied to one subscriber).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum TrackerEvent {
    /// A job created elsewhere was found during idle discovery.
    Discovered(JobHandle),
    /// The backend rejected the stored credential; the UI should re-authenticate.
    AuthenticationRequired,
    /// Tracking of `handle` was abandoned after a protocol error.
    Lost { handle: JobHandle, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub active_interval: Duration,
    pub idle_interval: Duration,
    /// How long an unobserved handle keeps polling before it is stopped.
    pub grace_period: Duration,
    pub status_retry: RetryPolicy,
    /// Listing endpoint for discovery; `None` disables discovery.
    pub discovery_path: Option<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_secs(3),
            idle_interval: Duration::from_secs(60),
            grace_period: Duration::from_secs(5),
            status_retry: RetryPolicy::default(),
            discovery_path: Some("/jobs".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Finish,
}

#[derive(Debug)]
struct LoopHandle {
    commands: mpsc::UnboundedSender<PollCommand>,
    token: CancellationToken,
    generation: u64,
}

struct PollerInner {
    transport: Arc<Transport>,
    registry: Arc<JobRegistry>,
    config: PollerConfig,
    loops: Mutex<HashMap<JobHandle, LoopHandle>>,
    releases: Mutex<HashMap<JobHandle, u64>>,
    next_generation: AtomicU64,
    next_release: AtomicU64,
    root: CancellationToken,
    events: broadcast::Sender<TrackerEvent>,
    wake: Notify,
    supervisor_started: AtomicBool,
    discovery_disabled: AtomicBool,
}

/// Explicit polling scheduler. Cheap to clone.
///
/// Methods that start tasks must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    pub fn new(transport: Arc<Transport>, registry: Arc<JobRegistry>, config: PollerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let discovery_disabled = config.discovery_path.is_none();
        Self {
            inner: Arc::new(PollerInner {
                transport,
                registry,
                config,
                loops: Mutex::new(HashMap::new()),
                releases: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                next_release: AtomicU64::new(1),
                root: CancellationToken::new(),
                events,
                wake: Notify::new(),
                supervisor_started: AtomicBool::new(false),
                discovery_disabled: AtomicBool::new(discovery_disabled),
            }),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.inner.config
    }

    /// Spawn the supervisor. Returns `None` if it is already running or the
    /// poller was shut down.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.root.is_cancelled() || self.inner.supervisor_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move { inner.supervise().await }))
    }

    /// Make sure `handle` has a running poll loop. Idempotent: returns
    /// `true` only when a new loop was spawned.
    pub fn ensure_polling(&self, handle: &JobHandle) -> bool {
        self.inner.cancel_release(handle);

        if self.inner.root.is_cancelled()
            || !self.inner.registry.contains(handle)
            || self.inner.registry.is_settled(handle)
        {
            return false;
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let token = self.inner.root.child_token();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut loops = self.inner.lock_loops();
            if loops
                .get(handle)
                .is_some_and(|existing| !existing.token.is_cancelled() && !existing.commands.is_closed())
            {
                return false;
            }
            loops.insert(
                handle.clone(),
                LoopHandle {
                    commands,
                    token: token.clone(),
                    generation,
                },
            );
        }

        tracing::info!(job = %handle, generation, "starting poll loop");
        let inner = Arc::clone(&self.inner);
        let handle = handle.clone();
        tokio::spawn(async move { inner.run_loop(handle, receiver, token, generation).await });
        self.inner.wake.notify_one();
        true
    }

    /// Ask the loop for `handle` to poll right away.
    pub fn poll_now(&self, handle: &JobHandle) -> bool {
        let sent = self
            .inner
            .lock_loops()
            .get(handle)
            .is_some_and(|l| l.commands.send(PollCommand::PollNow).is_ok());
        sent || self.ensure_polling(handle)
    }

    /// Stop the loop for `handle` immediately.
    pub fn stop(&self, handle: &JobHandle) -> bool {
        self.inner.stop_loop(handle)
    }

    /// Stop every loop without shutting the poller down (logout).
    pub fn stop_all(&self) {
        let handles: Vec<JobHandle> = self.inner.lock_loops().keys().cloned().collect();
        for handle in handles {
            self.inner.stop_loop(&handle);
        }
        lock(&self.inner.releases).clear();
    }

    /// Schedule `handle` to stop after the grace period unless it is
    /// observed again before then. Settled entries are then dropped from
    /// the registry.
    pub fn release(&self, handle: &JobHandle) {
        if self.inner.root.is_cancelled() {
            return;
        }
        let ticket = self.inner.next_release.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.releases).insert(handle.clone(), ticket);

        let inner = Arc::clone(&self.inner);
        let handle = handle.clone();
        let grace = inner.config.grace_period;
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.root.cancelled() => {}
                _ = tokio::time::sleep(grace) => inner.finish_release(&handle, ticket),
            }
        });
    }

    pub fn is_polling(&self, handle: &JobHandle) -> bool {
        self.inner
            .lock_loops()
            .get(handle)
            .is_some_and(|l| !l.token.is_cancelled())
    }

    pub fn active_loops(&self) -> usize {
        self.inner.lock_loops().len()
    }

    pub fn mode(&self) -> PollMode {
        self.inner.mode()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel every loop, in-flight request and pending timer.
    pub fn shutdown(&self) {
        tracing::info!("poller shutting down");
        self.inner.root.cancel();
        self.inner.lock_loops().clear();
        lock(&self.inner.releases).clear();
        self.inner.wake.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }
}

impl PollerInner {
    fn lock_loops(&self) -> MutexGuard<'_, HashMap<JobHandle, LoopHandle>> {
        lock(&self.loops)
    }

    fn mode(&self) -> PollMode {
        if self.root.is_cancelled() {
            PollMode::Stopped
        } else if !self.lock_loops().is_empty() {
            PollMode::Active
        } else if self.registry.is_empty() {
            PollMode::Stopped
        } else {
            PollMode::Idle
        }
    }

    fn emit(&self, event: TrackerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn stop_loop(&self, handle: &JobHandle) -> bool {
        let removed = self.lock_loops().remove(handle);
        match removed {
            Some(l) => {
                self.halt(handle, l);
                true
            }
            None => false,
        }
    }

    fn halt(&self, handle: &JobHandle, l: LoopHandle) {
        let _ = l.commands.send(PollCommand::Stop);
        l.token.cancel();
        tracing::info!(job = %handle, "poll loop stopped");
        self.wake.notify_one();
    }

    /// Remove the loop entry, unless a newer loop already replaced it.
    fn remove_loop(&self, handle: &JobHandle, generation: u64) {
        let mut loops = self.lock_loops();
        if loops.get(handle).is_some_and(|l| l.generation == generation) {
            loops.remove(handle);
        }
    }

    fn cancel_release(&self, handle: &JobHandle) {
        lock(&self.releases).remove(handle);
    }

    fn finish_release(&self, handle: &JobHandle, ticket: u64) {
        {
            let mut releases = lock(&self.releases);
            if releases.get(handle) != Some(&ticket) {
                return;
            }
            releases.remove(handle);
        }
        // Count and removal under the loops lock: an observer subscribes
        // before `ensure_polling` takes this lock, so it is either counted
        // here or finds the slot empty and spawns a fresh loop.
        let removed = {
            let mut loops = self.lock_loops();
            if self.registry.subscriber_count(handle) > 0 {
                return;
            }
            loops.remove(handle)
        };
        if let Some(l) = removed {
            self.halt(handle, l);
        }
        if self.registry.unregister_if_unreferenced(handle) {
            self.wake.notify_one();
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        handle: JobHandle,
        mut commands: mpsc::UnboundedReceiver<PollCommand>,
        token: CancellationToken,
        generation: u64,
    ) {
        'poll: loop {
            let fetch = self.poll_once(&handle);
            tokio::pin!(fetch);

            let control = loop {
                tokio::select! {
                    _ = token.cancelled() => break LoopControl::Finish,
                    control = &mut fetch => break control,
                    command = commands.recv() => match command {
                        Some(PollCommand::PollNow) => {
                            tracing::debug!(job = %handle, "poll already in flight; skipping");
                        }
                        Some(PollCommand::Stop) | None => break LoopControl::Finish,
                    },
                }
            };
            if control == LoopControl::Finish {
                break 'poll;
            }

            let sleep = tokio::time::sleep(self.config.active_interval);
            tokio::pin!(sleep);
            tokio::select! {
                _ = token.cancelled() => break 'poll,
                _ = &mut sleep => {}
                command = commands.recv() => match command {
                    Some(PollCommand::PollNow) => {}
                    Some(PollCommand::Stop) | None => break 'poll,
                },
            }
        }

        self.remove_loop(&handle, generation);
        self.wake.notify_one();
        tracing::debug!(job = %handle, generation, "poll loop exited");
    }

    /// One fetch-and-apply cycle for `handle`.
    async fn poll_once(&self, handle: &JobHandle) -> LoopControl {
        let Some(path) = self.registry.status_path(handle) else {
            return LoopControl::Finish;
        };
        if self.registry.is_settled(handle) {
            return LoopControl::Finish;
        }
        let Some(seq) = self.registry.next_request_seq(handle) else {
            return LoopControl::Finish;
        };

        let transport = &self.transport;
        let request = ApiRequest::get(path);
        let request = &request;
        let result = with_retry_logged(&self.config.status_retry, "poll status", move |_| {
            transport.send(request.clone())
        })
        .await;

        match result {
            Ok(response) => match wire::parse_status(&response.body) {
                Ok(status) => self.apply(handle, seq, status),
                Err(e) => {
                    tracing::error!(job = %handle, seq, error = %e, "malformed status payload");
                    let reason = format!("malformed status payload: {e}");
                    if self.registry.mark_lost(handle, reason.clone()) {
                        self.emit(TrackerEvent::Lost {
                            handle: handle.clone(),
                            reason,
                        });
                    }
                    LoopControl::Finish
                }
            },
            Err(TransportError::NotFound) => {
                tracing::warn!(job = %handle, seq, "status endpoint returned 404; marking failed");
                self.apply(handle, seq, JobStatus::failed(NOT_FOUND_MESSAGE))
            }
            Err(TransportError::Unauthorized) => {
                self.registry.mark_stale(handle, seq, TransportError::Unauthorized.to_string());
                if self.transport.credentials().take_invalidation_notice() {
                    self.emit(TrackerEvent::AuthenticationRequired);
                }
                LoopControl::Continue
            }
            Err(e) => {
                let error = match &e {
                    TransportError::Validation { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                let staleness = self.registry.mark_stale(handle, seq, error);
                tracing::warn!(job = %handle, seq, ?staleness, error = %e, "status refresh failed; keeping last known status");
                LoopControl::Continue
            }
        }
    }

    fn apply(&self, handle: &JobHandle, seq: u64, status: JobStatus) -> LoopControl {
        match self.registry.apply(handle, seq, status) {
            ApplyOutcome::Applied | ApplyOutcome::Unchanged | ApplyOutcome::Discarded => {
                if self.registry.is_settled(handle) {
                    tracing::info!(job = %handle, "job reached a terminal state; polling stopped");
                    LoopControl::Finish
                } else {
                    LoopControl::Continue
                }
            }
            ApplyOutcome::ProtocolViolation => {
                let reason = self
                    .registry
                    .get(handle)
                    .and_then(|snapshot| snapshot.lost)
                    .unwrap_or_else(|| "protocol error".to_string());
                self.emit(TrackerEvent::Lost {
                    handle: handle.clone(),
                    reason,
                });
                LoopControl::Finish
            }
            ApplyOutcome::Unknown => LoopControl::Finish,
        }
    }

    async fn supervise(self: Arc<Self>) {
        tracing::info!("poll supervisor started");
        loop {
            if self.root.is_cancelled() {
                break;
            }
            match self.mode() {
                PollMode::Stopped => {
                    tokio::select! {
                        _ = self.root.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = self.registry.changed().notified() => {}
                    }
                }
                mode => {
                    tokio::select! {
                        _ = self.root.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = self.registry.changed().notified() => {}
                        _ = tokio::time::sleep(self.config.idle_interval) => {
                            self.sweep_settled();
                            let discovery_enabled = !self.discovery_disabled.load(Ordering::SeqCst);
                            if mode == PollMode::Idle && discovery_enabled {
                                tokio::select! {
                                    _ = self.root.cancelled() => break,
                                    _ = self.discover() => {}
                                }
                            }
                        }
                    }
                }
            }
        }
        tracing::info!("poll supervisor stopped");
    }

    /// Drop settled entries that nobody watches and that have no loop or
    /// pending release of their own.
    fn sweep_settled(&self) {
        for handle in self.registry.settled_unobserved() {
            if lock(&self.releases).contains_key(&handle) || self.lock_loops().contains_key(&handle) {
                continue;
            }
            if self.registry.unregister_if_unreferenced(&handle) {
                tracing::debug!(job = %handle, "swept settled, unobserved job");
            }
        }
    }

    /// Take a listed status for a known job that no loop is polling.
    fn refresh_unobserved(&self, handle: &JobHandle, status: JobStatus) {
        if self.lock_loops().contains_key(handle) || self.registry.subscriber_count(handle) > 0 {
            return;
        }
        let Some(seq) = self.registry.next_request_seq(handle) else {
            return;
        };
        self.apply(handle, seq, status);
    }

    /// List jobs: register unknown in-flight ones and refresh known ones
    /// that are not being polled.
    async fn discover(&self) {
        let Some(path) = self.config.discovery_path.clone() else {
            return;
        };
        match self.transport.send(ApiRequest::get(path)).await {
            Ok(response) => match wire::parse_job_list(&response.body) {
                Ok(jobs) => {
                    for (handle, status) in jobs {
                        if self.registry.contains(&handle) {
                            self.refresh_unobserved(&handle, status);
                            continue;
                        }
                        if status.is_terminal() {
                            continue;
                        }
                        if self.registry.register_with_status(handle.clone(), None, status) {
                            tracing::info!(job = %handle, "discovered out-of-band job");
                            self.emit(TrackerEvent::Discovered(handle));
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "undecodable job listing"),
            },
            Err(TransportError::NotFound) => {
                tracing::info!("job listing endpoint not available; discovery disabled");
                self.discovery_disabled.store(true, Ordering::SeqCst);
            }
            Err(TransportError::Unauthorized) => {
                if self.transport.credentials().take_invalidation_notice() {
                    self.emit(TrackerEvent::AuthenticationRequired);
                }
            }
            Err(e) => tracing::debug!(error = %e, "job discovery failed"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("poller mutex poisoned; recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockReply};
    use crate::registry::JobEvent;
    use crate::transport::{Method, TransportConfig};
    use jobwatch_auth::{Credential, CredentialStore};
    use jobwatch_core::JobState;
    use serde_json::json;

    struct Fixture {
        backend: Arc<MockBackend>,
        registry: Arc<JobRegistry>,
        credentials: Arc<CredentialStore>,
        poller: Poller,
    }

    fn fixture(config: PollerConfig) -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let registry = Arc::new(JobRegistry::new());
        let credentials = Arc::new(CredentialStore::new());
        let transport = Arc::new(Transport::new(
            backend.clone(),
            credentials.clone(),
            TransportConfig {
                base_url: "http://api.test".into(),
                default_timeout: Duration::from_secs(10),
                upload_timeout: Duration::from_secs(100),
            },
        ));
        let poller = Poller::new(transport, registry.clone(), config);
        Fixture {
            backend,
            registry,
            credentials,
            poller,
        }
    }

    fn config() -> PollerConfig {
        PollerConfig {
            status_retry: RetryPolicy::exponential(2, Duration::from_millis(100), 2.0),
            discovery_path: None,
            ..PollerConfig::default()
        }
    }

    fn handle(id: &str) -> JobHandle {
        JobHandle::new(id).unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_terminal_then_exits() {
        let f = fixture(config());
        let h = handle("1");
        f.registry.register(h.clone(), None);
        f.backend.push(Method::Get, "/jobs/1", MockReply::status("processing", 50));
        f.backend.push(Method::Get, "/jobs/1", MockReply::status("completed", 100));

        assert!(f.poller.ensure_polling(&h));
        assert!(!f.poller.ensure_polling(&h));
        settle().await;
        assert_eq!(f.registry.get(&h).unwrap().status.progress, 50);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(f.registry.get(&h).unwrap().status.state, JobState::Completed);
        assert!(!f.poller.is_polling(&h));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.backend.request_count(Method::Get, "/jobs/1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_now_is_skipped_while_a_fetch_is_in_flight() {
        let f = fixture(config());
        let h = handle("1");
        f.registry.register(h.clone(), None);
        f.backend.push(
            Method::Get,
            "/jobs/1",
            MockReply::delayed(Duration::from_secs(2), 200, json!({"status": "processing", "progress": 10})),
        );

        f.poller.ensure_polling(&h);
        settle().await;
        for _ in 0..5 {
            assert!(f.poller.poll_now(&h));
        }
        settle().await;

        assert_eq!(f.backend.in_flight("/jobs/1"), 1);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        settle().await;
        assert_eq!(f.backend.max_in_flight("/jobs/1"), 1);
        assert_eq!(f.backend.request_count(Method::Get, "/jobs/1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_the_job_stale() {
        let f = fixture(config());
        let h = handle("1");
        f.registry.register(h.clone(), None);
        f.backend.push(Method::Get, "/jobs/1", MockReply::json(503, json!({"detail": "down"})));

        f.poller.ensure_polling(&h);
        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;

        let snapshot = f.registry.get(&h).unwrap();
        assert_eq!(snapshot.staleness, 1);
        assert_eq!(snapshot.status, JobStatus::pending());
        assert!(f.poller.is_polling(&h));
        assert_eq!(f.backend.request_count(Method::Get, "/jobs/1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_requests_reauthentication_once() {
        let f = fixture(config());
        f.credentials.set(Credential::bearer("tok"));
        let mut events = f.poller.subscribe_events();
        let h = handle("1");
        f.registry.register(h.clone(), None);
        f.backend.push(Method::Get, "/jobs/1", MockReply::json(401, json!({"detail": "expired"})));

        f.poller.ensure_polling(&h);
        settle().await;
        tokio::time::sleep(Duration::from_secs(7)).await;
        settle().await;

        assert_eq!(events.try_recv().unwrap(), TrackerEvent::AuthenticationRequired);
        assert!(events.try_recv().is_err());
        assert!(f.registry.get(&h).unwrap().staleness >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_abandons_the_job() {
        let f = fixture(config());
        let mut events = f.poller.subscribe_events();
        let h = handle("1");
        f.registry.register(h.clone(), None);
        f.backend.push(Method::Get, "/jobs/1", MockReply::json(200, json!({"status": "exploded"})));

        f.poller.ensure_polling(&h);
        settle().await;

        assert!(f.registry.get(&h).unwrap().lost.is_some());
        assert!(matches!(events.try_recv().unwrap(), TrackerEvent::Lost { .. }));
        assert!(!f.poller.is_polling(&h));
    }

    #[tokio::test(start_paused = true)]
    async fn release_waits_for_the_grace_period() {
        let f = fixture(config());
        let h = handle("1");
        f.registry.register(h.clone(), None);
        f.backend.push(Method::Get, "/jobs/1", MockReply::status("processing", 5));

        f.poller.ensure_polling(&h);
        settle().await;
        f.poller.release(&h);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(f.poller.is_polling(&h));
        // Observed again before the grace period ran out.
        f.poller.ensure_polling(&h);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.poller.is_polling(&h));

        f.poller.release(&h);
        tokio::time::sleep(Duration::from_millis(5001)).await;
        settle().await;
        assert!(!f.poller.is_polling(&h));
        // Not settled, so the entry itself stays.
        assert!(f.registry.contains(&h));
    }

    #[tokio::test(start_paused = true)]
    async fn release_keeps_the_loop_for_a_late_subscriber() {
        let f = fixture(config());
        let h = handle("1");
        f.registry.register(h.clone(), None);
        f.backend.push(Method::Get, "/jobs/1", MockReply::status("processing", 5));

        f.poller.ensure_polling(&h);
        settle().await;
        f.poller.release(&h);
        // Subscribed while the release is pending; its loop is already alive.
        let sub = f.registry.subscribe(&h).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert!(f.poller.is_polling(&h));

        f.registry.unsubscribe(&h, sub.id);
        f.poller.release(&h);
        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert!(!f.poller.is_polling(&h));

        let _sub = f.registry.subscribe(&h).unwrap();
        assert!(f.poller.ensure_polling(&h));
        assert!(f.poller.is_polling(&h));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_refresh_surfaces_the_backend_message() {
        let f = fixture(config());
        let h = handle("1");
        f.registry.register(h.clone(), None);
        let mut sub = f.registry.subscribe(&h).unwrap();
        sub.receiver.try_recv().unwrap();
        f.backend.push(Method::Get, "/jobs/1", MockReply::json(422, json!({"detail": "unsupported language: xx"})));

        f.poller.ensure_polling(&h);
        settle().await;

        assert_eq!(
            sub.receiver.try_recv().unwrap(),
            JobEvent::Stale {
                status: JobStatus::pending(),
                staleness: 1,
                error: "unsupported language: xx".into(),
            }
        );
        // Rejections are not retried.
        assert_eq!(f.backend.request_count(Method::Get, "/jobs/1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_everything() {
        let f = fixture(config());
        f.poller.start();
        for id in ["a", "b"] {
            let h = handle(id);
            f.registry.register(h.clone(), None);
            f.backend.push(Method::Get, h.status_path(), MockReply::Hang);
            f.poller.ensure_polling(&h);
        }
        settle().await;
        assert_eq!(f.poller.mode(), PollMode::Active);

        f.poller.shutdown();
        settle().await;

        assert_eq!(f.poller.mode(), PollMode::Stopped);
        assert_eq!(f.poller.active_loops(), 0);
        assert_eq!(f.backend.in_flight("/jobs/a"), 0);
        assert!(!f.poller.ensure_polling(&handle("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_discovery_registers_out_of_band_jobs() {
        let f = fixture(PollerConfig {
            discovery_path: Some("/jobs".into()),
            ..config()
        });
        let mut events = f.poller.subscribe_events();
        f.registry
            .register_with_status(handle("done"), None, JobStatus::new(JobState::Completed, 100));
        f.backend.push(
            Method::Get,
            "/jobs",
            MockReply::json(200, json!([
                {"id": "done", "status": "completed"},
                {"id": "new", "status": "processing", "progress": 20},
                {"id": "old", "status": "failed"}
            ])),
        );

        f.poller.start();
        settle().await;
        assert_eq!(f.poller.mode(), PollMode::Idle);
        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        assert_eq!(events.try_recv().unwrap(), TrackerEvent::Discovered(handle("new")));
        assert!(!f.registry.contains(&handle("old")));
        assert_eq!(f.registry.get(&handle("new")).unwrap().status.progress, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_listing_endpoint_disables_discovery() {
        let f = fixture(PollerConfig {
            discovery_path: Some("/jobs".into()),
            ..config()
        });
        f.registry
            .register_with_status(handle("done"), None, JobStatus::failed("x"));

        f.poller.start();
        tokio::time::sleep(Duration::from_secs(200)).await;
        settle().await;

        assert_eq!(f.backend.request_count(Method::Get, "/jobs"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_refreshes_unwatched_jobs_and_sweeps_settled_ones() {
        let f = fixture(PollerConfig {
            discovery_path: Some("/jobs".into()),
            ..config()
        });
        f.registry
            .register_with_status(handle("done"), None, JobStatus::new(JobState::Completed, 100));
        f.backend.push(
            Method::Get,
            "/jobs",
            MockReply::json(200, json!([{"id": "n", "status": "processing", "progress": 20}])),
        );
        f.backend.push(
            Method::Get,
            "/jobs",
            MockReply::json(200, json!([{"id": "n", "status": "completed", "progress": 100}])),
        );

        f.poller.start();
        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert!(!f.registry.contains(&handle("done")));
        assert_eq!(
            f.registry.get(&handle("n")).unwrap().status,
            JobStatus::new(JobState::Processing, 20)
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(
            f.registry.get(&handle("n")).unwrap().status,
            JobStatus::new(JobState::Completed, 100)
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert!(f.registry.is_empty());
        assert_eq!(f.poller.mode(), PollMode::Stopped);
    }
}
