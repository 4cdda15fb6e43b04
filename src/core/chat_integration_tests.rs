//! End-to-end conversation flows through `App` with stubbed collaborators.

use std::sync::Arc;

use tempfile::TempDir;

use crate::api::ROLE_SYSTEM;
use crate::core::app::App;
use crate::core::chat::SubmitError;
use crate::core::clock::FixedClock;
use crate::core::config::Config;
use crate::core::constants::{
    BACKEND_FAILURE_APOLOGY, FREE_LIMIT, KEY_LAST_RESET, KEY_MESSAGE_COUNT, WINDOW_MS,
};
use crate::core::conversation::test_support::{StubBackend, StubReply};
use crate::core::conversation::{ConversationProtocol, SamplingSettings};
use crate::core::entitlement::{Offer, SandboxEntitlements};
use crate::core::message::Role;
use crate::core::store::{FileStore, KeyValueStore, MemoryStore};

const NOW: i64 = 1_700_000_000_000;

async fn app_with(store: Arc<dyn KeyValueStore>, clock: Arc<FixedClock>) -> App {
    let entitlements = Arc::new(SandboxEntitlements::new(store.clone()));
    App::bootstrap(Config::default(), store, entitlements, clock)
        .await
        .expect("bootstrap succeeds")
}

fn protocol(backend: Arc<StubBackend>) -> ConversationProtocol {
    ConversationProtocol::new(backend, SamplingSettings::default())
}

#[tokio::test]
async fn eleventh_free_send_is_rejected_before_the_backend() {
    let clock = Arc::new(FixedClock::new(NOW));
    let app = app_with(Arc::new(MemoryStore::new()), clock.clone()).await;
    let backend = StubBackend::text("Keep going!");
    let protocol = protocol(backend.clone());
    let mut session = app.start_conversation("productivity-coach", None).unwrap();

    for i in 0..FREE_LIMIT {
        clock.advance(1_000);
        let outcome = session
            .submit(&format!("Question {i}"), app.quota(), false, &protocol)
            .await
            .unwrap();
        assert!(!outcome.failed);
        assert_eq!(outcome.quota.count, i + 1);
    }

    let err = session
        .submit("One more?", app.quota(), false, &protocol)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::QuotaExceeded(_)));
    assert_eq!(backend.calls(), FREE_LIMIT as usize);
    assert_eq!(session.turns().len(), 2 * FREE_LIMIT as usize);
    assert_eq!(app.quota_status().await.remaining, Some(0));
}

#[tokio::test]
async fn backend_failure_appends_one_apology_and_spends_quota() {
    let clock = Arc::new(FixedClock::new(NOW));
    let app = app_with(Arc::new(MemoryStore::new()), clock).await;
    let protocol = protocol(StubBackend::failing());
    let mut session = app.start_conversation("career-mentor", None).unwrap();

    let outcome = session
        .submit("Should I switch teams?", app.quota(), false, &protocol)
        .await
        .unwrap();

    assert!(outcome.failed);
    let turns = session.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "Should I switch teams?");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].content, BACKEND_FAILURE_APOLOGY);
    assert_eq!(app.quota_status().await.state.count, 1);
}

#[tokio::test]
async fn streamed_fragments_arrive_in_order_and_form_the_reply() {
    let clock = Arc::new(FixedClock::new(NOW));
    let app = app_with(Arc::new(MemoryStore::new()), clock).await;
    let backend = StubBackend::fragments(&["He", "llo"]);
    let protocol = protocol(backend.clone());
    let mut session = app
        .start_conversation("health-guide", Some("Runs 5k twice a week".to_string()))
        .unwrap();

    let mut chunks = Vec::new();
    let outcome = session
        .submit_streaming("Hi", app.quota(), false, &protocol, |chunk| {
            chunks.push(chunk.to_string())
        })
        .await
        .unwrap();

    assert_eq!(chunks, vec!["He".to_string(), "llo".to_string()]);
    assert_eq!(outcome.reply.content, "Hello");

    let request = backend.last_request().unwrap();
    assert_eq!(request.messages[0].role, ROLE_SYSTEM);
    assert!(request.messages[0]
        .content
        .ends_with("\n\nUser Context: Runs 5k twice a week"));
    assert_eq!(request.messages.last().unwrap().content, "Hi");
}

#[tokio::test]
async fn partial_stream_failure_is_replaced_by_the_apology() {
    let clock = Arc::new(FixedClock::new(NOW));
    let app = app_with(Arc::new(MemoryStore::new()), clock).await;
    let protocol = protocol(StubBackend::new(StubReply::FailAfter(vec![
        "Start small".to_string(),
    ])));
    let mut session = app.start_conversation("career-mentor", None).unwrap();

    let mut chunks = Vec::new();
    let outcome = session
        .submit_streaming("Help", app.quota(), false, &protocol, |chunk| {
            chunks.push(chunk.to_string())
        })
        .await
        .unwrap();

    assert_eq!(chunks, vec!["Start small".to_string()]);
    assert!(outcome.failed);
    assert_eq!(session.turns().len(), 2);
    assert_eq!(session.turns()[1].content, BACKEND_FAILURE_APOLOGY);
}

#[tokio::test]
async fn expired_window_on_disk_is_reset_at_startup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.toml");
    {
        let store = FileStore::new(path.clone());
        store.set(KEY_MESSAGE_COUNT, "10").unwrap();
        store.set(KEY_LAST_RESET, &(NOW - 90_000_000).to_string()).unwrap();
    }

    let clock = Arc::new(FixedClock::new(NOW));
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(path.clone()));
    let app = app_with(store, clock.clone()).await;
    assert_eq!(app.quota_status().await.state.count, 0);

    let protocol = protocol(StubBackend::text("Welcome back"));
    let mut session = app.start_conversation("career-mentor", None).unwrap();
    session
        .submit("Hello again", app.quota(), false, &protocol)
        .await
        .unwrap();

    let reopened = FileStore::new(path);
    assert_eq!(reopened.get(KEY_MESSAGE_COUNT).unwrap().as_deref(), Some("1"));
    assert_eq!(reopened.get(KEY_LAST_RESET).unwrap(), Some(NOW.to_string()));
}

#[tokio::test]
async fn window_boundary_is_exclusive() {
    let clock = Arc::new(FixedClock::new(NOW));
    let store = Arc::new(MemoryStore::new());
    let app = app_with(store, clock.clone()).await;
    let protocol = protocol(StubBackend::text("ok"));
    let mut session = app.start_conversation("career-mentor", None).unwrap();

    for _ in 0..FREE_LIMIT {
        session.submit("go", app.quota(), false, &protocol).await.unwrap();
    }

    clock.set(NOW + WINDOW_MS);
    assert!(session.submit("go", app.quota(), false, &protocol).await.is_err());

    clock.set(NOW + WINDOW_MS + 1);
    assert!(session.submit("go", app.quota(), false, &protocol).await.is_ok());
    assert_eq!(app.quota_status().await.state.count, 1);
}

#[tokio::test]
async fn conversations_share_one_quota() {
    let clock = Arc::new(FixedClock::new(NOW));
    let app = app_with(Arc::new(MemoryStore::new()), clock).await;
    let protocol = protocol(StubBackend::text("ok"));
    let mut first = app.start_conversation("career-mentor", None).unwrap();
    let mut second = app.start_conversation("health-guide", None).unwrap();

    for _ in 0..FREE_LIMIT / 2 {
        first.submit("a", app.quota(), false, &protocol).await.unwrap();
        second.submit("b", app.quota(), false, &protocol).await.unwrap();
    }

    assert!(first.submit("a", app.quota(), false, &protocol).await.is_err());
    assert!(second.submit("b", app.quota(), false, &protocol).await.is_err());
}

#[tokio::test]
async fn premium_sends_are_unlimited_but_still_counted() {
    let clock = Arc::new(FixedClock::new(NOW));
    let mut app = app_with(Arc::new(MemoryStore::new()), clock).await;
    app.upgrade(Offer::Monthly).await.unwrap();
    let backend = StubBackend::text("Invest early");
    let protocol = protocol(backend.clone());
    let mut session = app.start_conversation("finance-advisor", None).unwrap();

    let is_premium = app.is_premium();
    for _ in 0..FREE_LIMIT + 5 {
        session
            .submit("Budget tips?", app.quota(), is_premium, &protocol)
            .await
            .unwrap();
    }

    assert_eq!(backend.calls(), (FREE_LIMIT + 5) as usize);
    let status = app.quota_status().await;
    assert_eq!(status.remaining, None);
    assert_eq!(status.state.count, FREE_LIMIT + 5);
}
