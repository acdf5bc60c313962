//! Raw HTTP exchange abstraction.
//!
//! [`HttpBackend`] is the only seam that touches the network. Everything
//! above it (auth injection, timeout policy, error classification) lives in
//! [`super::Transport`] so it can be exercised against a scripted backend.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

/// HTTP verbs used by the job API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl core::fmt::Display for Method {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary upload (e.g. a lecture recording) sent as a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPayload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
    /// Extra text fields sent alongside the file part.
    pub fields: Vec<(String, String)>,
}

impl BinaryPayload {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Request body shapes understood by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(BinaryPayload),
}

impl RequestBody {
    /// Whether the body carries a binary upload (selects the upload timeout).
    pub fn is_binary(&self) -> bool {
        matches!(self, RequestBody::Multipart(_))
    }
}

/// A fully resolved request, ready to put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
}

impl RawRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status line plus the undecoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(value.to_string()),
        }
    }

    pub fn text(status: u16, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: Some(content_type.into()),
            body: body.into(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Bytes::new(),
        }
    }
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request could not be built: {0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Other(String),
}

/// Asynchronous HTTP client abstraction.
///
/// Implementations perform exactly one exchange per call: no retries, no
/// status-code interpretation. `request.timeout` should be honoured where the
/// client supports it; [`super::Transport`] enforces it regardless.
#[async_trait::async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: RawRequest) -> Result<RawResponse, BackendError>;
}

#[async_trait::async_trait]
impl<B> HttpBackend for Arc<B>
where
    B: HttpBackend + ?Sized,
{
    async fn execute(&self, request: RawRequest) -> Result<RawResponse, BackendError> {
        (**self).execute(request).await
    }
}
