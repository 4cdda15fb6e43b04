//! Completion backend for OpenAI-compatible chat APIs.
//!
//! [`CompletionBackend`] is the seam the conversation protocol talks to.
//! [`OpenAiBackend`] implements it over `reqwest`, in both atomic mode and
//! SSE streaming mode.

use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use memchr::memchr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{ChatCompletion, ChatMessage, ChatRequest, ChatResponse};

/// Finite, single-pass sequence of text fragments in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug)]
pub enum BackendError {
    /// The request never produced a response (DNS, TLS, timeout, reset).
    Transport(reqwest::Error),

    /// The API answered with a non-success status.
    Status { status: u16, message: String },

    /// The response body was not the expected JSON.
    Decode(String),

    /// The stream carried an error payload instead of a chunk.
    Api(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Transport(err) => write!(f, "Request failed: {err}"),
            BackendError::Status { status, message } => {
                write!(f, "API request failed with status {status}: {message}")
            }
            BackendError::Decode(detail) => write!(f, "Unexpected API response: {detail}"),
            BackendError::Api(message) => write!(f, "{message}"),
        }
    }
}

impl StdError for BackendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            BackendError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err)
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Whole-response completion. An empty string means the backend had
    /// nothing to say; substitution is the caller's concern.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError>;

    /// Incremental completion.
    async fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream, BackendError>;
}

#[derive(Clone, Debug)]
enum StreamMessage {
    Chunk(String),
    Error(String),
    End,
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        };

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            stream,
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(self.chat_url())
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            let message = format_api_error(&error_text);
            warn!(status, error = %message, "Chat completion request rejected");
            return Err(BackendError::Status { status, message });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let response = self.post(request, false).await?;
        let text = response.text().await?;
        let completion: ChatCompletion =
            serde_json::from_str(&text).map_err(|err| BackendError::Decode(err.to_string()))?;
        Ok(completion.first_content().unwrap_or_default())
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<FragmentStream, BackendError> {
        let response = self.post(request, true).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = body.next().await {
                if tx.is_closed() {
                    debug!("Fragment consumer dropped; abandoning stream");
                    return;
                }

                let chunk_bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx.send(StreamMessage::Error(format!("Stream interrupted: {err}")));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk_bytes);

                while let Some(newline_pos) = memchr(b'\n', &buffer) {
                    let should_end = match std::str::from_utf8(&buffer[..newline_pos]) {
                        Ok(line) => process_sse_line(line.trim(), &tx),
                        Err(err) => {
                            warn!(error = %err, "Skipping invalid UTF-8 line in stream");
                            false
                        }
                    };
                    buffer.drain(..=newline_pos);
                    if should_end {
                        return;
                    }
                }
            }

            debug!("Chat completion stream closed by server");
            let _ = tx.send(StreamMessage::End);
        });

        Ok(receiver_stream(rx))
    }
}

fn receiver_stream(rx: mpsc::UnboundedReceiver<StreamMessage>) -> FragmentStream {
    Box::pin(futures_util::stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        match rx.recv().await {
            Some(StreamMessage::Chunk(content)) => Some((Ok(content), Some(rx))),
            Some(StreamMessage::Error(message)) => Some((Err(BackendError::Api(message)), None)),
            Some(StreamMessage::End) | None => None,
        }
    }))
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Returns true once the stream is finished.
fn handle_data_payload(payload: &str, tx: &mpsc::UnboundedSender<StreamMessage>) -> bool {
    if payload == "[DONE]" {
        let _ = tx.send(StreamMessage::End);
        return true;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            let content = response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .filter(|content| !content.is_empty());
            if let Some(content) = content {
                let _ = tx.send(StreamMessage::Chunk(content));
            }
            false
        }
        Err(_) => {
            if payload.trim().is_empty() {
                return false;
            }
            let _ = tx.send(StreamMessage::Error(format_api_error(payload)));
            let _ = tx.send(StreamMessage::End);
            true
        }
    }
}

fn process_sse_line(line: &str, tx: &mpsc::UnboundedSender<StreamMessage>) -> bool {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, tx))
        .unwrap_or(false)
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("error").and_then(|v| v.as_str()))
        .or_else(|| value.get("message").and_then(|v| v.as_str()))
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
}

/// Reduce an error body to a single readable line.
fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "API error: <empty response>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value) {
            return format!("API error: {summary}");
        }
        return format!("API error: {json_value}");
    }

    format!("API error: {}", trimmed.split_whitespace().collect::<Vec<_>>().join(" "))
}
