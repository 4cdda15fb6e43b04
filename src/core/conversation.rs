//! Turns a user utterance plus history into one assistant reply.
//!
//! Every request is one system instruction followed by the prior turns and
//! the new user turn, stripped down to role and content. Failures of any
//! kind collapse into [`AiResponseError`]; nothing is retried.

use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::api::{ChatMessage, ROLE_SYSTEM};
use crate::core::backend::{BackendError, CompletionBackend, CompletionRequest};
use crate::core::constants::{
    DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE, EMPTY_COMPLETION_FALLBACK,
};
use crate::core::message::{Role, Turn};

/// Fragments of one assistant reply, in arrival order.
pub type TurnStream = Pin<Box<dyn Stream<Item = Result<String, AiResponseError>> + Send>>;

/// The single failure signal callers see for a send or stream.
#[derive(Debug)]
pub struct AiResponseError {
    source: BackendError,
}

impl AiResponseError {
    /// Backend detail, for logs only.
    pub fn detail(&self) -> String {
        self.source.to_string()
    }
}

impl From<BackendError> for AiResponseError {
    fn from(source: BackendError) -> Self {
        Self { source }
    }
}

impl fmt::Display for AiResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to get AI response")
    }
}

impl StdError for AiResponseError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Inputs for one exchange.
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    pub persona_prompt: &'a str,
    pub user_context: Option<&'a str>,
    pub prior_turns: &'a [Turn],
    pub new_user_text: &'a str,
}

/// Assemble the outbound message list: exactly one system entry first.
pub fn build_request_messages(request: &TurnRequest<'_>) -> Vec<ChatMessage> {
    let context = request
        .user_context
        .map(|ctx| format!("User Context: {ctx}"))
        .unwrap_or_default();
    let system = format!("{}\n\n{}", request.persona_prompt, context);

    let mut messages = Vec::with_capacity(request.prior_turns.len() + 2);
    messages.push(ChatMessage::new(ROLE_SYSTEM, system));
    messages.extend(
        request
            .prior_turns
            .iter()
            .map(|turn| ChatMessage::new(turn.role.as_str(), turn.content.clone())),
    );
    messages.push(ChatMessage::new(Role::User.as_str(), request.new_user_text));
    messages
}

pub struct ConversationProtocol {
    backend: Arc<dyn CompletionBackend>,
    settings: SamplingSettings,
}

impl ConversationProtocol {
    pub fn new(backend: Arc<dyn CompletionBackend>, settings: SamplingSettings) -> Self {
        Self { backend, settings }
    }

    fn completion_request(&self, request: &TurnRequest<'_>) -> CompletionRequest {
        CompletionRequest {
            model: self.settings.model.clone(),
            messages: build_request_messages(request),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Whole-response send. Empty completions become the fallback text.
    pub async fn send(&self, request: TurnRequest<'_>) -> Result<String, AiResponseError> {
        let completion = self.completion_request(&request);
        match self.backend.complete(&completion).await {
            Ok(content) if content.is_empty() => {
                debug!("Backend returned an empty completion; using fallback text");
                Ok(EMPTY_COMPLETION_FALLBACK.to_string())
            }
            Ok(content) => Ok(content),
            Err(err) => {
                warn!(error = %err, "Chat completion failed");
                Err(err.into())
            }
        }
    }

    /// Incremental send. The returned stream ends when the transport does.
    pub async fn stream(&self, request: TurnRequest<'_>) -> Result<TurnStream, AiResponseError> {
        let completion = self.completion_request(&request);
        let fragments = self.backend.stream(&completion).await.map_err(|err| {
            warn!(error = %err, "Chat completion stream failed to start");
            AiResponseError::from(err)
        })?;
        Ok(Box::pin(fragments.map(|item| {
            item.map_err(|err| {
                warn!(error = %err, "Chat completion stream failed");
                AiResponseError::from(err)
            })
        })))
    }

    /// Drive [`Self::stream`], handing each fragment to `on_chunk` as it
    /// arrives. Returns the concatenated reply, or the fallback text when no
    /// fragment carried content. Fragments already delivered before a failure
    /// stay delivered.
    pub async fn stream_with<F>(
        &self,
        request: TurnRequest<'_>,
        mut on_chunk: F,
    ) -> Result<String, AiResponseError>
    where
        F: FnMut(&str),
    {
        let mut fragments = self.stream(request).await?;
        let mut assembled = String::new();
        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            on_chunk(&fragment);
            assembled.push_str(&fragment);
        }
        if assembled.is_empty() {
            debug!("Stream ended without content; using fallback text");
            return Ok(EMPTY_COMPLETION_FALLBACK.to_string());
        }
        Ok(assembled)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::core::backend::FragmentStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted reply for [`StubBackend`].
    #[derive(Clone)]
    pub enum StubReply {
        Text(String),
        Fragments(Vec<String>),
        /// Deliver these fragments, then fail.
        FailAfter(Vec<String>),
        Fail,
    }

    pub struct StubBackend {
        reply: StubReply,
        calls: AtomicUsize,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl StubBackend {
        pub fn new(reply: StubReply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn text(text: &str) -> Arc<Self> {
            Self::new(StubReply::Text(text.to_string()))
        }

        pub fn fragments(fragments: &[&str]) -> Arc<Self> {
            Self::new(StubReply::Fragments(
                fragments.iter().map(|f| f.to_string()).collect(),
            ))
        }

        pub fn failing() -> Arc<Self> {
            Self::new(StubReply::Fail)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn last_request(&self) -> Option<CompletionRequest> {
            self.requests.lock().unwrap().last().cloned()
        }

        fn record(&self, request: &CompletionRequest) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
        }

        fn failure() -> BackendError {
            BackendError::Status {
                status: 503,
                message: "API error: unavailable".to_string(),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for StubBackend {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
            self.record(request);
            match &self.reply {
                StubReply::Text(text) => Ok(text.clone()),
                StubReply::Fragments(fragments) => Ok(fragments.concat()),
                StubReply::FailAfter(_) | StubReply::Fail => Err(Self::failure()),
            }
        }

        async fn stream(
            &self,
            request: &CompletionRequest,
        ) -> Result<FragmentStream, BackendError> {
            self.record(request);
            let items: Vec<Result<String, BackendError>> = match &self.reply {
                StubReply::Text(text) => vec![Ok(text.clone())],
                StubReply::Fragments(fragments) => fragments.iter().cloned().map(Ok).collect(),
                StubReply::FailAfter(fragments) => fragments
                    .iter()
                    .cloned()
                    .map(Ok)
                    .chain(std::iter::once(Err(BackendError::Api(
                        "API error: stream reset".to_string(),
                    ))))
                    .collect(),
                StubReply::Fail => return Err(Self::failure()),
            };
            Ok(Box::pin(futures_util::stream::iter(items)))
        }
    }
}
