//! Production [`HttpBackend`] on top of `reqwest`.

use reqwest::multipart::{Form, Part};

use super::backend::{BackendError, BinaryPayload, HttpBackend, Method, RawRequest, RawResponse, RequestBody};

/// HTTP backend using a shared `reqwest::Client` (connection pooling).
#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: RawRequest) -> Result<RawResponse, BackendError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);

        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(payload) => builder.multipart(multipart_form(payload)?),
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

fn multipart_form(payload: BinaryPayload) -> Result<Form, BackendError> {
    let part = Part::bytes(payload.bytes.to_vec())
        .file_name(payload.file_name)
        .mime_str(&payload.content_type)
        .map_err(|e| BackendError::InvalidRequest(format!("invalid content type: {e}")))?;

    let form = payload
        .fields
        .into_iter()
        .fold(Form::new(), |form, (name, value)| form.text(name, value));

    Ok(form.part("file", part))
}

fn map_reqwest_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else if e.is_builder() {
        BackendError::InvalidRequest(e.to_string())
    } else if e.is_connect() || e.is_request() || e.is_body() {
        BackendError::Connect(e.to_string())
    } else {
        BackendError::Other(e.to_string())
    }
}
