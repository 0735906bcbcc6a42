//! Retrying HTTP invoker.
//!
//! One [`RetryPolicy`] replaces the per-tool retry loops: attempt `i`
//! (1-indexed) waits `(i - 1) * base_delay` before it starts, and a failure
//! is retried only while attempts remain and [`RetryOn`] allows it.

use crate::http::{HttpRequest, HttpResponse, Transport};
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Failure of a single attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvokeError {
    /// Connection refused, DNS failure, timeout, broken body stream.
    #[error("transport error: {message}")]
    Transport {
        /// Error message
        message: String,
    },

    /// The service answered with a non-2xx status.
    #[error("HTTP status {code}: {body}")]
    Status {
        /// Status code
        code: u16,
        /// Response body, lossily decoded
        body: String,
    },

    /// The body could not be decoded into the expected shape.
    #[error("decode error: {message}")]
    Decode {
        /// Error message
        message: String,
    },

    /// The run was cancelled while this call was in flight or waiting.
    #[error("request cancelled")]
    Cancelled,
}

impl InvokeError {
    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Status { .. } => ErrorKind::Status,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Coarse classification of an [`InvokeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`InvokeError::Transport`]
    Transport,
    /// See [`InvokeError::Status`]
    Status,
    /// See [`InvokeError::Decode`]
    Decode,
    /// See [`InvokeError::Cancelled`]
    Cancelled,
}

/// Which failures are worth another attempt.
///
/// Decode errors and cancellation are never retried, whatever the variant.
#[derive(Clone, Default)]
pub enum RetryOn {
    /// Every transport error and every non-2xx status.
    #[default]
    AnyFailure,
    /// Transport errors, 5xx, 408 and 429. Other 4xx fail immediately.
    Transient,
    /// Caller-supplied predicate.
    Custom(Arc<dyn Fn(&InvokeError) -> bool + Send + Sync>),
}

impl std::fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnyFailure => f.write_str("AnyFailure"),
            Self::Transient => f.write_str("Transient"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl RetryOn {
    /// Returns true if `error` may be retried.
    #[must_use]
    pub fn allows(&self, error: &InvokeError) -> bool {
        match error {
            InvokeError::Decode { .. } | InvokeError::Cancelled => false,
            _ => match self {
                Self::AnyFailure => true,
                Self::Transient => match error {
                    InvokeError::Status { code, .. } => *code >= 500 || matches!(code, 408 | 429),
                    _ => true,
                },
                Self::Custom(predicate) => predicate(error),
            },
        }
    }
}

/// Retry budget and backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Backoff unit; attempt `i` waits `(i - 1) * base_delay`
    pub base_delay: Duration,
    /// Retryability predicate
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    /// Creates a policy that retries any failure.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            retry_on: RetryOn::AnyFailure,
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Replaces the retryability predicate.
    #[must_use]
    pub fn with_retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Total attempts the policy allows.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay slept before attempt `attempt` (1-indexed).
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_sub(1))
    }
}

/// Successful invocation.
#[derive(Debug, Clone)]
pub struct Invocation<T> {
    /// Decoded body
    pub body: T,
    /// Wall time from the first attempt to the end of the body, in ms
    pub latency_ms: u64,
    /// Duration of the successful attempt alone, in ms
    pub attempt_ms: u64,
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Correlation id returned by the service, if any
    pub identifier: Option<String>,
}

/// Invocation that exhausted its policy.
#[derive(Debug, Clone, Error)]
#[error("{last_error} (after {attempts} attempt(s))")]
pub struct InvocationFailure {
    /// Classification of `last_error`
    pub kind: ErrorKind,
    /// Error of the final attempt
    pub last_error: InvokeError,
    /// Attempts made
    pub attempts: u32,
}

/// Outcome of one [`Invoker`] call.
pub type InvocationResult<T> = std::result::Result<Invocation<T>, InvocationFailure>;

/// Executes requests under a [`RetryPolicy`].
#[derive(Clone)]
pub struct Invoker {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("policy", &self.policy)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Invoker {
    /// Creates an invoker over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Aborts waits and in-flight attempts once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Performs `request` and buffers the whole body.
    pub async fn invoke(&self, request: &HttpRequest) -> InvocationResult<Bytes> {
        self.invoke_with(request, HttpResponse::bytes).await
    }

    /// Performs `request` and hands each 2xx response to `read`.
    ///
    /// `read` runs once per successful-status attempt; an error it returns
    /// counts as that attempt's failure and goes through the same policy.
    pub async fn invoke_with<T, F, Fut>(&self, request: &HttpRequest, read: F) -> InvocationResult<T>
    where
        F: Fn(HttpResponse) -> Fut,
        Fut: Future<Output = std::result::Result<T, InvokeError>>,
    {
        let start = Instant::now();
        let mut attempt = 1;

        loop {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!(url = %request.url, attempt, ?delay, "Waiting before retry");
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        return Err(self.failure(InvokeError::Cancelled, attempt - 1));
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }

            let attempt_start = Instant::now();
            match self.attempt(request, &read).await {
                Ok((body, identifier)) => {
                    if attempt > 1 {
                        info!(url = %request.url, attempt, "Request succeeded after retry");
                    }
                    return Ok(Invocation {
                        body,
                        latency_ms: elapsed_ms(start),
                        attempt_ms: elapsed_ms(attempt_start),
                        attempts: attempt,
                        identifier,
                    });
                }
                Err(error) => {
                    if attempt >= self.policy.max_attempts() || !self.policy.retry_on.allows(&error) {
                        return Err(self.failure(error, attempt));
                    }
                    warn!(
                        url = %request.url,
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        %error,
                        "Request failed, will retry"
                    );
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        request: &HttpRequest,
        read: &F,
    ) -> std::result::Result<(T, Option<String>), InvokeError>
    where
        F: Fn(HttpResponse) -> Fut,
        Fut: Future<Output = std::result::Result<T, InvokeError>>,
    {
        let call = async {
            let response = self.transport.send(request).await?;
            if !response.is_success() {
                let code = response.status;
                let body = response.text_lossy().await.unwrap_or_default();
                return Err(InvokeError::Status { code, body });
            }
            let identifier = response.request_id.clone();
            let body = read(response).await?;
            Ok((body, identifier))
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(InvokeError::Cancelled),
            result = call => result,
        }
    }

    fn failure(&self, last_error: InvokeError, attempts: u32) -> InvocationFailure {
        InvocationFailure {
            kind: last_error.kind(),
            last_error,
            attempts,
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
