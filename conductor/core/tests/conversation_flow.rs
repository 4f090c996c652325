//! End-to-end conversation tests
//!
//! These tests drive the public `Conductor` API against real stores:
//! - new conversations get persisted messages and exactly one title
//! - follow-ups and edited branches send only their own thread
//! - aborts keep the partial reply, conflicts leave the running request alone
//! - the HTTP backend and file store work together

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{wait_for_progress, MockBackend};
use conductor_core::{
    AskRequest, BackendConfig, Conductor, ConductorConfig, ConductorError, ConductorMessage,
    ConversationStore, FileStore, MemoryStore, MessageId, OpenAiCompatBackend,
};

type MemoryConductor = Conductor<MockBackend, MemoryStore>;

fn setup(backend: MockBackend) -> (Arc<MemoryConductor>, Arc<MockBackend>, Arc<MemoryStore>) {
    let backend = Arc::new(backend);
    let store = Arc::new(MemoryStore::new());
    let conductor = Conductor::new(
        Arc::clone(&backend),
        Arc::clone(&store),
        ConductorConfig::default(),
    )
    .unwrap();
    (Arc::new(conductor), backend, store)
}

// =============================================================================
// New Conversations
// =============================================================================

#[tokio::test]
async fn test_hello_creates_conversation_with_one_title_request() {
    let (conductor, backend, store) = setup(MockBackend::replying(["Hi", " there"]));
    let (tx, mut rx) = mpsc::channel(64);

    let response = conductor
        .handle(AskRequest::new("alice", "Hello"), tx)
        .await
        .unwrap();

    let conv = response.request_message.conversation_id;
    let messages = store.messages(conv);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text, "Hello");
    assert!(messages[0].parent_message_id.is_root());
    assert_eq!(messages[1].text, "Hi there");
    assert_eq!(messages[1].parent_message_id, messages[0].message_id);
    assert!(!messages[1].unfinished && !messages[1].cancelled && !messages[1].error);

    assert_eq!(backend.streaming_calls(), 1);
    assert_eq!(backend.title_calls(), 1);
    assert_eq!(response.title.as_deref(), Some("Greetings"));
    let title = store.load_conversation_title("alice", conv).await.unwrap();
    assert_eq!(title.as_deref(), Some("Greetings"));

    let mut terminals = 0;
    while let Some(msg) = rx.recv().await {
        if msg.is_terminal() {
            terminals += 1;
            assert!(matches!(msg, ConductorMessage::Final(_)));
        }
    }
    assert_eq!(terminals, 1);
}

// =============================================================================
// Threading
// =============================================================================

#[tokio::test]
async fn test_follow_up_on_an_edited_branch_sends_only_that_branch() {
    let (conductor, backend, _store) = setup(MockBackend::replying(["ok"]));

    let (tx, _rx) = mpsc::channel(64);
    let first = conductor
        .handle(AskRequest::new("alice", "Hola"), tx)
        .await
        .unwrap();
    let conv = first.request_message.conversation_id;

    // An edit of the first question: a sibling under the root
    let (tx, _rx) = mpsc::channel(64);
    let edited = conductor
        .handle(
            AskRequest::new("alice", "Hello").in_conversation(conv, MessageId::root()),
            tx,
        )
        .await
        .unwrap();

    let (tx, _rx) = mpsc::channel(64);
    conductor
        .handle(
            AskRequest::new("alice", "Weather?")
                .in_conversation(conv, edited.response_message.message_id),
            tx,
        )
        .await
        .unwrap();

    let threads = backend.sent_threads();
    assert_eq!(threads.len(), 3);
    assert_eq!(threads[2], vec!["Hello", "ok", "Weather?"]);
    // Both root questions were titled, the follow-up was not
    assert_eq!(backend.title_calls(), 2);
}

#[tokio::test]
async fn test_dangling_parent_still_answers() {
    let (conductor, backend, _store) = setup(MockBackend::replying(["ok"]));
    let (tx, _rx) = mpsc::channel(64);

    let request = AskRequest::new("alice", "Anyone?")
        .in_conversation(conductor_core::ConversationId::new(), MessageId::new());
    let response = conductor.handle(request, tx).await.unwrap();

    assert_eq!(response.response_message.text, "ok");
    assert_eq!(backend.sent_threads()[0], vec!["Anyone?"]);
}

// =============================================================================
// Abort and Conflicts
// =============================================================================

#[tokio::test]
async fn test_abort_preserves_partial_reply() {
    let (conductor, _backend, store) = setup(MockBackend::replying(["Once", " upon"]).held_open());
    let (tx, mut rx) = mpsc::channel(64);

    let running = {
        let conductor = Arc::clone(&conductor);
        tokio::spawn(async move {
            conductor
                .handle(AskRequest::new("alice", "Tell a story").with_abort_key("story"), tx)
                .await
        })
    };
    wait_for_progress(&mut rx, 2).await;

    let aborted = conductor.abort("story").await.unwrap();
    let persisted = store.message(aborted.response_message.message_id).unwrap();
    assert_eq!(persisted.text, "Once upon");
    assert!(persisted.cancelled);
    assert!(!persisted.unfinished);
    assert!(!persisted.error);

    let handled = running.await.unwrap().unwrap();
    assert_eq!(handled.response_message, persisted);
    assert_eq!(conductor.active_count(), 0);
}

#[tokio::test]
async fn test_abort_unknown_key_writes_nothing() {
    let (conductor, backend, store) = setup(MockBackend::replying(["ok"]));

    let result = conductor.abort("no-such-key").await;

    assert!(matches!(result, Err(ConductorError::NotFound { .. })));
    assert_eq!(store.write_count(), 0);
    assert_eq!(backend.streaming_calls(), 0);
}

#[tokio::test]
async fn test_second_request_under_live_key_is_rejected() {
    let (conductor, backend, _store) = setup(MockBackend::replying(["Working"]).held_open());
    let (tx, mut rx) = mpsc::channel(64);

    let first = {
        let conductor = Arc::clone(&conductor);
        tokio::spawn(async move {
            conductor
                .handle(AskRequest::new("alice", "Long task").with_abort_key("job"), tx)
                .await
        })
    };
    wait_for_progress(&mut rx, 1).await;

    let (tx2, _rx2) = mpsc::channel(8);
    let second = conductor
        .handle(AskRequest::new("alice", "Another").with_abort_key("job"), tx2)
        .await;
    match second {
        Err(ConductorError::Conflict { key }) => assert_eq!(key, "job"),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(backend.streaming_calls(), 1);
    assert!(conductor.is_active("job"));

    let aborted = conductor.abort("job").await.unwrap();
    assert_eq!(aborted.response_message.text, "Working");
    assert!(first.await.unwrap().is_ok());
}

// =============================================================================
// HTTP Backend with File Storage
// =============================================================================

#[tokio::test]
async fn test_http_backend_with_file_store() {
    let server = MockServer::start().await;
    let stream_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(stream_body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "\"Greetings\""}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    store.init().await.unwrap();
    let backend = Arc::new(OpenAiCompatBackend::new(BackendConfig::new(server.uri())).unwrap());
    let conductor = Conductor::new(backend, Arc::clone(&store), ConductorConfig::default()).unwrap();

    let (tx, _rx) = mpsc::channel(64);
    let response = conductor
        .handle(AskRequest::new("alice", "Hello"), tx)
        .await
        .unwrap();
    assert_eq!(response.response_message.text, "Hi there");
    assert_eq!(response.title.as_deref(), Some("Greetings"));

    // A new store over the same directory sees the finished exchange
    let reopened = FileStore::new(dir.path());
    let conv = response.request_message.conversation_id;
    let messages = reopened.load_messages(conv).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text, "Hi there");
    assert!(!messages[1].unfinished);
    let conversation = reopened.load_conversation("alice", conv).await.unwrap().unwrap();
    assert_eq!(conversation.title.as_deref(), Some("Greetings"));
    assert_eq!(conversation.model_options["model"], "ggml-vicuna1.17b-q5_1.bin");
}
