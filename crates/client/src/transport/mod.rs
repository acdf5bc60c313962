//! Single HTTP call primitive: auth injection, timeout policy and response
//! normalization.

mod backend;
mod error;
mod reqwest_backend;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use jobwatch_auth::CredentialStore;

pub use backend::{
    BackendError, BinaryPayload, HttpBackend, Method, RawRequest, RawResponse, RequestBody,
};
pub use error::TransportError;
pub use reqwest_backend::ReqwestBackend;

/// Longest body excerpt kept in a [`TransportError::MalformedBody`].
const SNIPPET_LEN: usize = 120;

/// Transport settings derived from the client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub base_url: String,
    /// Timeout for JSON and empty bodies.
    pub default_timeout: Duration,
    /// Timeout for multipart uploads.
    pub upload_timeout: Duration,
}

/// An API call relative to the configured base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path such as `/jobs/42`, or an absolute URL used as-is.
    pub path: String,
    pub body: RequestBody,
    /// Per-call override of the timeout policy.
    pub timeout: Option<Duration>,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method,
            path: path.into(),
            body,
            timeout: None,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path, RequestBody::Empty)
    }

    pub fn post(path: impl Into<String>, body: RequestBody) -> Self {
        Self::new(Method::Post, path, body)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Normalized successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// `Value::Null` for 204 and other empty bodies.
    pub body: Value,
}

impl ApiResponse {
    pub fn is_empty(&self) -> bool {
        self.body.is_null()
    }
}

/// Sends API requests through an [`HttpBackend`].
pub struct Transport {
    backend: Arc<dyn HttpBackend>,
    credentials: Arc<CredentialStore>,
    config: TransportConfig,
}

impl Transport {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        credentials: Arc<CredentialStore>,
        config: TransportConfig,
    ) -> Self {
        Self {
            backend,
            credentials,
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Timeout applied to `request`: explicit override, else by body shape.
    pub fn timeout_for(&self, request: &ApiRequest) -> Duration {
        request.timeout.unwrap_or(if request.body.is_binary() {
            self.config.upload_timeout
        } else {
            self.config.default_timeout
        })
    }

    pub fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.config.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// Perform one HTTP exchange and classify the outcome.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let timeout = self.timeout_for(&request);
        let url = self.resolve_url(&request.path);

        let mut headers = request.headers;
        headers.push(("Accept".to_string(), "application/json".to_string()));
        let sent_token = self.credentials.bearer_token(Utc::now());
        if let Some(token) = &sent_token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }

        debug!(
            method = %request.method,
            url = %url,
            timeout_ms = timeout.as_millis() as u64,
            "sending request"
        );

        let raw = RawRequest {
            method: request.method,
            url,
            headers,
            body: request.body,
            timeout,
        };

        let response = match tokio::time::timeout(timeout, self.backend.execute(raw)).await {
            Err(_elapsed) => return Err(TransportError::Timeout(timeout)),
            Ok(Err(BackendError::Timeout)) => return Err(TransportError::Timeout(timeout)),
            Ok(Err(BackendError::Connect(msg))) | Ok(Err(BackendError::Other(msg))) => {
                return Err(TransportError::Connection(msg));
            }
            Ok(Err(BackendError::InvalidRequest(msg))) => {
                return Err(TransportError::InvalidRequest(msg));
            }
            Ok(Ok(response)) => response,
        };

        self.normalize(response, sent_token.as_deref())
    }

    /// `sent_token` is the bearer token attached to the request, if any.
    fn normalize(
        &self,
        response: RawResponse,
        sent_token: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        let status = response.status;

        if status == 204 {
            return Ok(ApiResponse {
                status,
                body: Value::Null,
            });
        }

        if status == 401 {
            if let Some(token) = sent_token {
                self.credentials.invalidate_if_current(token);
            }
            return Err(TransportError::Unauthorized);
        }

        if status == 404 {
            return Err(TransportError::NotFound);
        }

        let parsed = parse_body(&response);

        match status {
            200..=299 => parsed
                .map(|body| ApiResponse { status, body })
                .map_err(|snippet| {
                    warn!(status, snippet = %snippet, "non-JSON success body");
                    TransportError::MalformedBody { status, snippet }
                }),
            500..=599 => Err(TransportError::Server {
                status,
                message: match parsed {
                    Ok(body) => error_message(&body).unwrap_or_else(|| default_reason(status)),
                    Err(snippet) => snippet,
                },
            }),
            400..=499 => match parsed {
                Ok(body) => Err(TransportError::Validation {
                    status,
                    message: error_message(&body).unwrap_or_else(|| default_reason(status)),
                }),
                Err(snippet) => Err(TransportError::MalformedBody { status, snippet }),
            },
            _ => Err(TransportError::Validation {
                status,
                message: default_reason(status),
            }),
        }
    }
}

/// Decode a JSON body; an empty body decodes to `Null`. On failure returns
/// a short excerpt of the offending body.
fn parse_body(response: &RawResponse) -> Result<Value, String> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&response.body).map_err(|_| snippet(&response.body))
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SNIPPET_LEN).collect()
}

/// Pull a human-readable message out of a structured error body.
fn error_message(body: &Value) -> Option<String> {
    ["detail", "message", "error"].iter().find_map(|key| {
        body.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    })
}

fn default_reason(status: u16) -> String {
    format!("HTTP {status}")
}
