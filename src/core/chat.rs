//! Per-conversation controller.
//!
//! A [`ChatSession`] owns the turn history for one persona and enforces a
//! single outstanding request. A send is split into [`ChatSession::begin`]
//! and [`ChatSession::finish`] so front ends can keep the session available
//! while the backend call is in flight. [`ChatSession::submit`] and
//! [`ChatSession::submit_streaming`] run both halves around a protocol call.
//!
//! History policy: the user turn is appended as soon as the send is admitted
//! and is never rolled back. When the call resolves, exactly one assistant
//! turn is appended, either the reply or a fixed apology. The quota is
//! spent either way.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::clock::Clock;
use crate::core::constants::BACKEND_FAILURE_APOLOGY;
use crate::core::conversation::{AiResponseError, ConversationProtocol, TurnRequest};
use crate::core::message::{Role, Turn};
use crate::core::persona::Persona;
use crate::core::quota::{QuotaExceeded, QuotaState, SharedQuotaGate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    Sending,
}

#[derive(Debug)]
pub enum SubmitError {
    EmptyInput,
    /// A previous send has not resolved yet.
    Busy,
    QuotaExceeded(QuotaExceeded),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::EmptyInput => write!(f, "Message is empty"),
            SubmitError::Busy => write!(f, "Still waiting for the previous reply"),
            SubmitError::QuotaExceeded(err) => write!(f, "{err}"),
        }
    }
}

impl StdError for SubmitError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            SubmitError::QuotaExceeded(err) => Some(err),
            _ => None,
        }
    }
}

/// An admitted send awaiting its backend result.
#[derive(Debug)]
pub struct PendingSend {
    persona_prompt: String,
    user_context: Option<String>,
    prior_turns: Vec<Turn>,
    text: String,
    quota: QuotaState,
}

impl PendingSend {
    pub fn request(&self) -> TurnRequest<'_> {
        TurnRequest {
            persona_prompt: &self.persona_prompt,
            user_context: self.user_context.as_deref(),
            prior_turns: &self.prior_turns,
            new_user_text: &self.text,
        }
    }

    pub fn quota(&self) -> QuotaState {
        self.quota
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// The assistant turn that was appended.
    pub reply: Turn,
    /// True when `reply` is the apology for a failed call.
    pub failed: bool,
    /// Quota state after this send was counted.
    pub quota: QuotaState,
}

pub struct ChatSession {
    persona: Persona,
    user_context: Option<String>,
    turns: Vec<Turn>,
    state: ConversationState,
    next_id: u64,
    last_timestamp_ms: i64,
    clock: Arc<dyn Clock>,
}

impl ChatSession {
    pub fn new(persona: Persona, user_context: Option<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            persona,
            user_context: user_context.filter(|ctx| !ctx.trim().is_empty()),
            turns: Vec::new(),
            state: ConversationState::Idle,
            next_id: 1,
            last_timestamp_ms: i64::MIN,
            clock,
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn user_context(&self) -> Option<&str> {
        self.user_context.as_deref()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn is_sending(&self) -> bool {
        self.state == ConversationState::Sending
    }

    /// Suggestions to show while the conversation is still empty.
    pub fn sample_prompts(&self) -> &[String] {
        if self.turns.is_empty() {
            &self.persona.sample_prompts
        } else {
            &[]
        }
    }

    /// Admit a send: check the lock and the quota, then append the user turn.
    pub async fn begin(
        &mut self,
        text: &str,
        quota: &SharedQuotaGate,
        is_premium: bool,
    ) -> Result<PendingSend, SubmitError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitError::EmptyInput);
        }
        if self.is_sending() {
            return Err(SubmitError::Busy);
        }

        let quota_state = quota
            .acquire(is_premium)
            .await
            .map_err(SubmitError::QuotaExceeded)?;

        let pending = PendingSend {
            persona_prompt: self.persona.system_prompt.clone(),
            user_context: self.user_context.clone(),
            prior_turns: self.turns.clone(),
            text: text.to_string(),
            quota: quota_state,
        };

        self.push_turn(Role::User, text.to_string());
        self.state = ConversationState::Sending;
        debug!(
            persona = %self.persona.id,
            turns = self.turns.len(),
            quota_count = quota_state.count,
            "Send admitted"
        );
        Ok(pending)
    }

    /// Resolve a send with the backend result. Appends exactly one turn.
    pub fn finish(
        &mut self,
        pending: PendingSend,
        result: Result<String, AiResponseError>,
    ) -> SubmitOutcome {
        let (content, failed) = match result {
            Ok(content) => (content, false),
            Err(err) => {
                warn!(
                    persona = %self.persona.id,
                    error = %err,
                    detail = %err.detail(),
                    "Chat error"
                );
                (BACKEND_FAILURE_APOLOGY.to_string(), true)
            }
        };

        let reply = self.push_turn(Role::Assistant, content);
        self.state = ConversationState::Idle;
        SubmitOutcome {
            reply,
            failed,
            quota: pending.quota,
        }
    }

    /// Send and wait for the whole reply.
    pub async fn submit(
        &mut self,
        text: &str,
        quota: &SharedQuotaGate,
        is_premium: bool,
        protocol: &ConversationProtocol,
    ) -> Result<SubmitOutcome, SubmitError> {
        let pending = self.begin(text, quota, is_premium).await?;
        let result = protocol.send(pending.request()).await;
        Ok(self.finish(pending, result))
    }

    /// Send with incremental delivery. The final turn holds the assembled
    /// fragments, the fallback text if none carried content, or the apology
    /// if the stream failed part way.
    pub async fn submit_streaming<F>(
        &mut self,
        text: &str,
        quota: &SharedQuotaGate,
        is_premium: bool,
        protocol: &ConversationProtocol,
        on_chunk: F,
    ) -> Result<SubmitOutcome, SubmitError>
    where
        F: FnMut(&str),
    {
        let pending = self.begin(text, quota, is_premium).await?;
        let result = protocol.stream_with(pending.request(), on_chunk).await;
        Ok(self.finish(pending, result))
    }

    fn push_turn(&mut self, role: Role, content: String) -> Turn {
        let timestamp_ms = self.clock.now_ms().max(self.last_timestamp_ms);
        self.last_timestamp_ms = timestamp_ms;

        let turn = Turn {
            id: self.next_id.to_string(),
            persona_id: self.persona.id.clone(),
            role,
            content,
            timestamp_ms,
        };
        self.next_id += 1;
        self.turns.push(turn.clone());
        turn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::FixedClock;
    use crate::core::constants::EMPTY_COMPLETION_FALLBACK;
    use crate::core::conversation::test_support::StubBackend;
    use crate::core::conversation::SamplingSettings;
    use crate::core::persona::PersonaCatalog;
    use crate::core::quota::QuotaGate;
    use crate::core::store::MemoryStore;

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        clock: Arc<FixedClock>,
        quota: SharedQuotaGate,
        session: ChatSession,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(NOW));
        let store = Arc::new(MemoryStore::new());
        let quota = SharedQuotaGate::new(QuotaGate::new(store, clock.clone()));
        let persona = PersonaCatalog::builtin()
            .unwrap()
            .find("productivity-coach")
            .cloned()
            .unwrap();
        let session = ChatSession::new(persona, None, clock.clone());
        Fixture {
            clock,
            quota,
            session,
        }
    }

    #[tokio::test]
    async fn successful_submit_appends_user_then_assistant() {
        let mut fx = fixture();
        let protocol =
            ConversationProtocol::new(StubBackend::text("hello"), SamplingSettings::default());

        let outcome = fx
            .session
            .submit("  hi  ", &fx.quota, false, &protocol)
            .await
            .unwrap();

        assert!(!outcome.failed);
        assert_eq!(outcome.reply.content, "hello");
        assert_eq!(outcome.quota.count, 1);

        let turns = fx.session.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "hi");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].persona_id, "productivity-coach");
        assert_ne!(turns[0].id, turns[1].id);
        assert_eq!(fx.session.state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn failure_appends_apology_and_keeps_user_turn() {
        let mut fx = fixture();
        let protocol =
            ConversationProtocol::new(StubBackend::failing(), SamplingSettings::default());

        let outcome = fx
            .session
            .submit("help", &fx.quota, false, &protocol)
            .await
            .unwrap();

        assert!(outcome.failed);
        let turns = fx.session.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "help");
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, BACKEND_FAILURE_APOLOGY);
        // Quota is spent even though the call failed.
        assert_eq!(fx.quota.snapshot().await.count, 1);
    }

    #[tokio::test]
    async fn second_begin_while_sending_is_busy() {
        let mut fx = fixture();
        let pending = fx.session.begin("first", &fx.quota, false).await.unwrap();
        assert!(fx.session.is_sending());

        let err = fx
            .session
            .begin("second", &fx.quota, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Busy));
        assert_eq!(fx.session.turns().len(), 1);
        assert_eq!(fx.quota.snapshot().await.count, 1);

        fx.session.finish(pending, Ok("done".to_string()));
        assert_eq!(fx.session.state(), ConversationState::Idle);
        assert!(fx.session.begin("third", &fx.quota, false).await.is_ok());
    }

    #[tokio::test]
    async fn blank_input_is_rejected_without_side_effects() {
        let mut fx = fixture();
        let err = fx.session.begin("   ", &fx.quota, false).await.unwrap_err();
        assert!(matches!(err, SubmitError::EmptyInput));
        assert!(fx.session.turns().is_empty());
        assert_eq!(fx.quota.snapshot().await.count, 0);
    }

    #[tokio::test]
    async fn pending_request_excludes_the_new_turn_from_history() {
        let mut fx = fixture();
        let protocol =
            ConversationProtocol::new(StubBackend::text("ok"), SamplingSettings::default());
        fx.session
            .submit("one", &fx.quota, false, &protocol)
            .await
            .unwrap();

        let pending = fx.session.begin("two", &fx.quota, false).await.unwrap();
        let request = pending.request();
        assert_eq!(request.prior_turns.len(), 2);
        assert_eq!(request.new_user_text, "two");
        assert_eq!(fx.session.turns().len(), 3);
    }

    #[tokio::test]
    async fn streaming_submit_assembles_reply() {
        let mut fx = fixture();
        let protocol = ConversationProtocol::new(
            StubBackend::fragments(&["He", "llo"]),
            SamplingSettings::default(),
        );

        let mut chunks = Vec::new();
        let outcome = fx
            .session
            .submit_streaming("hi", &fx.quota, false, &protocol, |c| {
                chunks.push(c.to_string())
            })
            .await
            .unwrap();

        assert_eq!(chunks, vec!["He".to_string(), "llo".to_string()]);
        assert_eq!(outcome.reply.content, "Hello");
        assert_eq!(fx.session.turns().len(), 2);
    }

    #[tokio::test]
    async fn empty_stream_stores_fallback_reply() {
        let mut fx = fixture();
        let protocol =
            ConversationProtocol::new(StubBackend::fragments(&[]), SamplingSettings::default());

        let mut chunks = 0;
        let outcome = fx
            .session
            .submit_streaming("hi", &fx.quota, false, &protocol, |_| chunks += 1)
            .await
            .unwrap();

        assert_eq!(chunks, 0);
        assert!(!outcome.failed);
        assert_eq!(outcome.reply.content, EMPTY_COMPLETION_FALLBACK);
        assert_eq!(fx.session.turns()[1].content, EMPTY_COMPLETION_FALLBACK);
    }

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let mut fx = fixture();
        let protocol =
            ConversationProtocol::new(StubBackend::text("ok"), SamplingSettings::default());

        fx.session
            .submit("one", &fx.quota, false, &protocol)
            .await
            .unwrap();
        fx.clock.set(NOW - 5_000);
        fx.session
            .submit("two", &fx.quota, false, &protocol)
            .await
            .unwrap();

        let stamps: Vec<i64> = fx.session.turns().iter().map(|t| t.timestamp_ms).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn sample_prompts_only_for_empty_conversation() {
        let mut fx = fixture();
        assert_eq!(fx.session.sample_prompts().len(), 3);

        let protocol =
            ConversationProtocol::new(StubBackend::text("hello"), SamplingSettings::default());
        fx.session
            .submit("hi", &fx.quota, false, &protocol)
            .await
            .unwrap();
        assert!(fx.session.sample_prompts().is_empty());
    }

    #[test]
    fn blank_user_context_is_dropped() {
        let fx = fixture();
        let session = ChatSession::new(
            fx.session.persona().clone(),
            Some("   ".to_string()),
            fx.clock.clone(),
        );
        assert!(session.user_context.is_none());
    }
}
