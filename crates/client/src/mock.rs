//! Scripted in-memory [`HttpBackend`] for tests and offline demos.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Value, json};

use crate::transport::{BackendError, HttpBackend, Method, RawRequest, RawResponse};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(RawResponse),
    /// Respond after sleeping (tokio time, so paused clocks apply).
    Delayed(Duration, RawResponse),
    Fail(BackendError),
    /// Never complete; only a timeout or cancellation ends the call.
    Hang,
}

impl MockReply {
    pub fn json(status: u16, body: Value) -> Self {
        MockReply::Respond(RawResponse::json(status, &body))
    }

    pub fn html(status: u16, body: &str) -> Self {
        MockReply::Respond(RawResponse::text(status, "text/html", body.to_string()))
    }

    /// `GET /jobs/{id}` style body.
    pub fn status(state: &str, progress: u8) -> Self {
        Self::json(200, json!({ "status": state, "progress": progress }))
    }

    pub fn delayed(delay: Duration, status: u16, body: Value) -> Self {
        MockReply::Delayed(delay, RawResponse::json(status, &body))
    }
}

#[derive(Debug, Default)]
struct MockState {
    routes: HashMap<(Method, String), VecDeque<MockReply>>,
    requests: Vec<RawRequest>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Backend that answers from per-route reply queues.
///
/// Each `(method, path)` route pops its replies in order and keeps
/// repeating the last one. Unscripted routes answer `404`.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reply to the queue for `method path`.
    pub fn push(&self, method: Method, path: impl Into<String>, reply: MockReply) {
        self.lock()
            .routes
            .entry((method, path.into()))
            .or_default()
            .push_back(reply);
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RawRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self, method: Method, path: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.method == method && path_of(&r.url) == path)
            .count()
    }

    /// Requests to `path` currently awaiting a reply.
    pub fn in_flight(&self, path: &str) -> usize {
        self.lock().in_flight.get(path).copied().unwrap_or(0)
    }

    /// Highest number of concurrent requests ever seen for `path`.
    pub fn max_in_flight(&self, path: &str) -> usize {
        self.lock().max_in_flight.get(path).copied().unwrap_or(0)
    }

    fn next_reply(&self, request: &RawRequest) -> MockReply {
        let mut state = self.lock();
        state.requests.push(request.clone());
        let key = (request.method, path_of(&request.url).to_string());
        match state.routes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(MockReply::Hang),
            Some(queue) => queue.front().cloned().unwrap_or(MockReply::Hang),
            None => MockReply::json(404, json!({ "detail": "no mock route" })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Tracks one in-flight request; decrements on drop, including cancellation.
struct InFlight {
    state: Arc<Mutex<MockState>>,
    path: String,
}

impl InFlight {
    fn enter(state: &Arc<Mutex<MockState>>, path: &str) -> Self {
        {
            let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
            let current = guard.in_flight.entry(path.to_string()).or_default();
            *current += 1;
            let now = *current;
            let max = guard.max_in_flight.entry(path.to_string()).or_default();
            *max = (*max).max(now);
        }
        Self {
            state: Arc::clone(state),
            path: path.to_string(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = guard.in_flight.get_mut(&self.path) {
            *current = current.saturating_sub(1);
        }
    }
}

#[async_trait::async_trait]
impl HttpBackend for MockBackend {
    async fn execute(&self, request: RawRequest) -> Result<RawResponse, BackendError> {
        let _in_flight = InFlight::enter(&self.state, path_of(&request.url));
        match self.next_reply(&request) {
            MockReply::Respond(response) => Ok(response),
            MockReply::Delayed(delay, response) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            MockReply::Fail(error) => Err(error),
            MockReply::Hang => std::future::pending().await,
        }
    }
}

/// Path component of `url` (`http://host/jobs/1?x` -> `/jobs/1`).
fn path_of(url: &str) -> &str {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme
        .find('/')
        .map_or("/", |i| &without_scheme[i..]);
    path.split('?').next().unwrap_or(path)
}
