//! OpenAI-compatible chat completion client.
//!
//! Sits on the [`Invoker`]: each call is retried under its policy, and the
//! body is decoded as either a single JSON document or an event stream.
//! A malformed blocking body fails the call, while a malformed stream chunk
//! is skipped and counted.

use crate::http::HttpRequest;
use crate::retry::{InvocationFailure, InvokeError, Invoker};
use crate::sse::{ChunkPolicy, SseDecoder, decode_stream};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument};

/// Path appended to a model endpoint.
pub const COMPLETIONS_PATH: &str = "/v1/chat/completions";

static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(<think>)?.*?</think>").expect("think block pattern is valid"));

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// End user
    User,
    /// Model reply
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author
    pub role: Role,
    /// Text
    pub content: String,
}

impl Message {
    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// How the reply body is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// One JSON document
    Blocking,
    /// `data: ` event stream
    Streaming,
}

impl ResponseMode {
    /// Suffix used in per-reply file names.
    #[must_use]
    pub const fn file_suffix(self) -> &'static str {
        match self {
            Self::Blocking => "",
            Self::Streaming => "_stream",
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => f.write_str("blocking"),
            Self::Streaming => f.write_str("streaming"),
        }
    }
}

/// Model-independent part of a completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    /// Remote model name
    pub model: String,
    /// Conversation, oldest first
    pub messages: Vec<Message>,
    /// Sampling temperature
    pub temperature: f64,
    /// End-user identifier forwarded to the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct BlockingBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<BlockingChoice>,
}

#[derive(Deserialize)]
struct BlockingChoice {
    #[serde(default)]
    message: BlockingMessage,
}

#[derive(Default, Deserialize)]
struct BlockingMessage {
    #[serde(default)]
    content: Option<String>,
}

/// A completed chat call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    /// Completion id from the body, else the request id header
    pub id: Option<String>,
    /// Reply text
    pub content: String,
    /// Wall time across all attempts
    pub latency_ms: u64,
    /// Duration of the successful attempt
    pub attempt_ms: u64,
    /// Attempts used
    pub attempts: u32,
    /// Malformed stream chunks skipped
    pub skipped_chunks: usize,
}

struct Body {
    content: String,
    id: Option<String>,
    skipped: usize,
}

/// Chat completion client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    invoker: Invoker,
}

/// Builds the completions URL for `endpoint`, tolerating a trailing slash.
#[must_use]
pub fn completions_url(endpoint: &str) -> String {
    format!("{}{COMPLETIONS_PATH}", endpoint.trim_end_matches('/'))
}

impl ChatClient {
    /// Creates a client that sends through `invoker`.
    #[must_use]
    pub const fn new(invoker: Invoker) -> Self {
        Self { invoker }
    }

    /// Sends `request` to `endpoint` and decodes the reply.
    ///
    /// A blocking reply without choices yields empty content.
    ///
    /// # Errors
    ///
    /// Returns the final failure once the retry policy gives up.
    #[instrument(skip(self, api_key, request), fields(model = %request.model, temperature = request.temperature))]
    pub async fn complete(
        &self,
        endpoint: &str,
        api_key: &str,
        request: &ChatRequest,
        mode: ResponseMode,
    ) -> Result<ChatReply, InvocationFailure> {
        let wire = WireRequest {
            request,
            stream: mode == ResponseMode::Streaming,
        };
        let http = HttpRequest::post(completions_url(endpoint))
            .bearer(api_key)
            .json(&wire)
            .map_err(|e| InvocationFailure {
                kind: crate::retry::ErrorKind::Decode,
                last_error: InvokeError::decode(e.to_string()),
                attempts: 0,
            })?;

        let invocation = match mode {
            ResponseMode::Blocking => {
                self.invoker
                    .invoke_with(&http, |response| async move {
                        let bytes = response.bytes().await?;
                        let body: BlockingBody = serde_json::from_slice(&bytes)
                            .map_err(|e| InvokeError::decode(format!("malformed completion body: {e}")))?;
                        let content = body
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message.content)
                            .unwrap_or_default();
                        Ok(Body {
                            content,
                            id: body.id.filter(|id| !id.is_empty()),
                            skipped: 0,
                        })
                    })
                    .await?
            }
            ResponseMode::Streaming => {
                self.invoker
                    .invoke_with(&http, |response| async move {
                        let decoded =
                            decode_stream(response.body, SseDecoder::new().with_policy(ChunkPolicy::Skip)).await?;
                        if decoded.skipped > 0 {
                            debug!(skipped = decoded.skipped, "Skipped malformed stream chunks");
                        }
                        Ok(Body {
                            content: decoded.text,
                            id: decoded.id,
                            skipped: decoded.skipped,
                        })
                    })
                    .await?
            }
        };

        Ok(ChatReply {
            id: invocation.body.id.or(invocation.identifier),
            content: invocation.body.content,
            latency_ms: invocation.latency_ms,
            attempt_ms: invocation.attempt_ms,
            attempts: invocation.attempts,
            skipped_chunks: invocation.body.skipped,
        })
    }
}

/// Removes `<think>...</think>` reasoning blocks and surrounding whitespace.
///
/// A closing tag without an opening one drops everything before it.
#[must_use]
pub fn strip_think(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::tests::ScriptedTransport;
    use crate::retry::{ErrorKind, RetryPolicy};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn client(transport: Arc<ScriptedTransport>) -> ChatClient {
        ChatClient::new(Invoker::new(transport, RetryPolicy::new(2, Duration::from_millis(1))))
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-test".to_string(),
            messages: vec![Message::system("be brief"), Message::user("hi")],
            temperature: 0.7,
            user: None,
        }
    }

    #[test]
    fn test_completions_url() {
        assert_eq!(
            completions_url("https://api.example.com/"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(completions_url("http://h:8080"), "http://h:8080/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_blocking_completion() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(
            r#"{"id":"chatcmpl-9","choices":[{"message":{"role":"assistant","content":"Hello there"}}]}"#,
        )]);
        let reply = client(Arc::clone(&transport))
            .complete("http://llm", "sk-1", &request(), ResponseMode::Blocking)
            .await
            .unwrap();

        assert_eq!(reply.content, "Hello there");
        assert_eq!(reply.id.as_deref(), Some("chatcmpl-9"));
        assert_eq!(reply.attempts, 1);

        let sent = transport.requests.lock().unwrap()[0].clone();
        assert_eq!(sent.url, "http://llm/v1/chat/completions");
        assert_eq!(sent.header_value("Authorization"), Some("Bearer sk-1"));
        let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert!(body.get("stream").is_none());
        assert!(body.get("user").is_none());
    }

    #[tokio::test]
    async fn test_blocking_without_choices_is_empty() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(r#"{"choices":[]}"#)]);
        let reply = client(transport)
            .complete("http://llm", "k", &request(), ResponseMode::Blocking)
            .await
            .unwrap();
        assert_eq!(reply.content, "");
        assert_eq!(reply.id, None);
    }

    #[tokio::test]
    async fn test_blocking_choice_without_message_is_empty() {
        let transport =
            ScriptedTransport::new(vec![ScriptedTransport::ok(r#"{"id":"c-1","choices":[{"finish_reason":"stop"}]}"#)]);
        let reply = client(Arc::clone(&transport))
            .complete("http://llm", "k", &request(), ResponseMode::Blocking)
            .await
            .unwrap();
        assert_eq!(reply.content, "");
        assert_eq!(reply.id.as_deref(), Some("c-1"));
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_blocking_body_fails_without_retry() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok("<html>gateway</html>")]);
        let failure = client(Arc::clone(&transport))
            .complete("http://llm", "k", &request(), ResponseMode::Blocking)
            .await
            .unwrap_err();

        assert_eq!(failure.kind, ErrorKind::Decode);
        assert_eq!(failure.attempts, 1);
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_streaming_completion_skips_bad_chunks() {
        let chunks = vec![
            Bytes::from("data: {\"id\":\"chatcmpl-s\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n"),
            Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n"),
            Bytes::from("data: {oops\n\n"),
            Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\ndata: [DONE]\n"),
        ];
        let transport = ScriptedTransport::new(vec![Ok((200, chunks))]);
        let mut req = request();
        req.user = Some("batch".to_string());

        let reply = client(Arc::clone(&transport))
            .complete("http://llm", "k", &req, ResponseMode::Streaming)
            .await
            .unwrap();

        assert_eq!(reply.content, "Hello");
        assert_eq!(reply.id.as_deref(), Some("chatcmpl-s"));
        assert_eq!(reply.skipped_chunks, 1);

        let sent = transport.requests.lock().unwrap()[0].clone();
        let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["user"], "batch");
    }

    #[tokio::test]
    async fn test_status_errors_are_retried() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::status(502),
            ScriptedTransport::ok(r#"{"choices":[{"message":{"content":"ok"}}]}"#),
        ]);
        let reply = client(Arc::clone(&transport))
            .complete("http://llm", "k", &request(), ResponseMode::Blocking)
            .await
            .unwrap();
        assert_eq!(reply.content, "ok");
        assert_eq!(reply.attempts, 2);
        assert!(reply.attempt_ms <= reply.latency_ms);
    }

    #[test]
    fn test_strip_think() {
        assert_eq!(strip_think("<think>\nponder\n</think>\n\nAnswer: 4"), "Answer: 4");
        assert_eq!(strip_think("half a thought</think> 42 "), "42");
        assert_eq!(strip_think("  plain answer\n"), "plain answer");
        assert_eq!(strip_think("<think>a</think>\n<think>b</think>\nx"), "x");
    }

    #[test]
    fn test_message_roles_serialize_lowercase() {
        let json = serde_json::to_string(&Message::assistant("a")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"a"}"#);
        let parsed: Message = serde_json::from_str(r#"{"role":"user","content":"q"}"#).unwrap();
        assert_eq!(parsed, Message::user("q"));
    }
}
