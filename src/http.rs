//! Outbound request descriptors and the transport seam.
//!
//! Every outbound call is described by the same `{method, url, headers, body}`
//! contract. The [`Transport`] trait is the one place where bytes leave the
//! process, so tests swap it for an in-memory fake.

use crate::error::{Error, Result};
use crate::retry::InvokeError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::time::Duration;

pub use reqwest::Method;

/// Header carrying the remote correlation id, when the service sends one.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Response body as a stream of chunks.
pub type BodyStream = BoxStream<'static, std::result::Result<Bytes, InvokeError>>;

/// One outbound request. The body is held as [`Bytes`] so every retry
/// attempt re-sends the same payload.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Extra headers, in insertion order
    pub headers: Vec<(String, String)>,
    /// Request body (empty for GET)
    pub body: Bytes,
}

impl HttpRequest {
    /// Creates a request with no headers and an empty body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a GET request.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Creates a POST request.
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds an `Authorization: Bearer` header.
    #[must_use]
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    /// Serializes `body` as JSON and sets the content type.
    ///
    /// # Errors
    ///
    /// Returns an error if `body` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = Bytes::from(serde_json::to_vec(body)?);
        Ok(self.header("Content-Type", "application/json"))
    }

    /// Returns the value of the first header named `name` (case-insensitive).
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response whose body has not been read yet.
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Correlation id from [`REQUEST_ID_HEADER`], if present
    pub request_id: Option<String>,
    /// Body chunks
    pub body: BodyStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Builds a response from an already-buffered body.
    #[must_use]
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        Self::from_chunks(status, vec![body.into()])
    }

    /// Builds a response that yields `chunks` one by one.
    #[must_use]
    pub fn from_chunks(status: u16, chunks: Vec<Bytes>) -> Self {
        Self {
            status,
            request_id: None,
            body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Reads the whole body.
    ///
    /// # Errors
    ///
    /// Returns the transport error raised while reading.
    pub async fn bytes(self) -> std::result::Result<Bytes, InvokeError> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(chunks.concat().into())
    }

    /// Reads the whole body as text, replacing invalid UTF-8.
    ///
    /// # Errors
    ///
    /// Returns the transport error raised while reading.
    pub async fn text_lossy(self) -> std::result::Result<String, InvokeError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Sends a single request. Implementations must not retry on their own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one attempt. Non-2xx statuses are returned as responses,
    /// only connection-level problems are errors.
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, InvokeError>;
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn transport_error(e: &reqwest::Error) -> InvokeError {
    if e.is_timeout() {
        InvokeError::transport(format!("timed out: {e}"))
    } else if e.is_connect() {
        InvokeError::transport(format!("connection failed: {e}"))
    } else {
        InvokeError::transport(e.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, InvokeError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| transport_error(&e))?;
        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map_err(|e| transport_error(&e))
            .boxed();

        Ok(HttpResponse {
            status,
            request_id,
            body,
        })
    }
}
