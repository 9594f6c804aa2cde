//! Integration tests for the inference client against a mock server: streaming, abort, errors,
//! summaries and model switching.

mod common;

use common::{wire_messages, MockServer, Plan};
use lib::llm::{LlmError, StreamOutcome};
use lib::session::WireMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[tokio::test]
async fn stream_delivers_tokens_in_order_then_completes() {
    let server = MockServer::start(Plan::default());
    let client = server.client();
    let abort = AtomicBool::new(false);
    let mut chunks = Vec::new();
    let mut on_chunk = |t: &str| chunks.push(t.to_string());

    let outcome = client
        .chat_stream("m1", &[WireMessage::user("hi")], 0.7, &abort, &mut on_chunk)
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Completed("t1t2t3".to_string()));
    assert_eq!(chunks, vec!["t1", "t2", "t3"]);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["stream"], true);
    assert_eq!(requests[0]["model"], "m1");
    assert!(requests[0].get("max_tokens").is_none());
    assert_eq!(wire_messages(&requests[0]), vec![("user".into(), "hi".into())]);
}

#[tokio::test]
async fn abort_before_first_chunk_yields_nothing() {
    let server = MockServer::start(Plan::default());
    let client = server.client();
    let abort = AtomicBool::new(true);
    let mut chunks: Vec<String> = Vec::new();
    let mut on_chunk = |t: &str| chunks.push(t.to_string());

    let outcome = client
        .chat_stream("m1", &[WireMessage::user("hi")], 0.7, &abort, &mut on_chunk)
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Aborted);
    assert!(chunks.is_empty());
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn abort_mid_stream_stops_at_next_line() {
    let server = MockServer::start(Plan {
        line_delay: Duration::from_millis(20),
        ..Plan::default()
    });
    let client = server.client();
    let abort = AtomicBool::new(false);
    let mut chunks: Vec<String> = Vec::new();
    let mut on_chunk = |t: &str| {
        chunks.push(t.to_string());
        abort.store(true, Ordering::SeqCst);
    };

    let outcome = client
        .chat_stream("m1", &[WireMessage::user("hi")], 0.7, &abort, &mut on_chunk)
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Aborted);
    assert_eq!(chunks, vec!["t1"]);
}

#[tokio::test]
async fn error_status_is_api_error() {
    let server = MockServer::start(Plan {
        fail_status: Some(500),
        ..Plan::default()
    });
    let client = server.client();
    let abort = AtomicBool::new(false);
    let mut chunks: Vec<String> = Vec::new();
    let mut on_chunk = |t: &str| chunks.push(t.to_string());

    let err = client
        .chat_stream("m1", &[WireMessage::user("hi")], 0.7, &abort, &mut on_chunk)
        .await
        .unwrap_err();

    match err {
        LlmError::Api { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "model exploded");
        }
        other => panic!("expected api error, got {:?}", other),
    }
    assert!(chunks.is_empty());
}

#[tokio::test]
async fn malformed_chunk_is_protocol_error_after_earlier_tokens() {
    let server = MockServer::start(Plan {
        tokens: vec!["a".into()],
        tail: Some("data: {not json\n\n".into()),
        ..Plan::default()
    });
    let client = server.client();
    let abort = AtomicBool::new(false);
    let mut chunks: Vec<String> = Vec::new();
    let mut on_chunk = |t: &str| chunks.push(t.to_string());

    let err = client
        .chat_stream("m1", &[WireMessage::user("hi")], 0.7, &abort, &mut on_chunk)
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::Protocol(_)), "{:?}", err);
    assert_eq!(chunks, vec!["a"]);
}

#[tokio::test]
async fn body_without_done_still_completes() {
    let server = MockServer::start(Plan {
        tokens: vec!["x".into(), "y".into()],
        tail: Some(String::new()),
        ..Plan::default()
    });
    let client = server.client();
    let abort = AtomicBool::new(false);
    let mut on_chunk = |_: &str| {};

    let outcome = client
        .chat_stream("m1", &[WireMessage::user("hi")], 0.7, &abort, &mut on_chunk)
        .await
        .unwrap();
    assert_eq!(outcome, StreamOutcome::Completed("xy".to_string()));
}

#[tokio::test]
async fn complete_sends_max_tokens_and_returns_content() {
    let server = MockServer::start(Plan::default());
    let client = server.client();

    let text = client
        .complete("m1", &[WireMessage::user("q")], 0.3, Some(512))
        .await
        .unwrap();

    assert_eq!(text, "SUMMARY");
    let requests = server.requests();
    assert_eq!(requests[0]["stream"], false);
    assert_eq!(requests[0]["max_tokens"], 512);
    assert_eq!(requests[0]["temperature"], 0.3);
}

#[tokio::test]
async fn models_are_listed_and_active_model_is_first() {
    let server = MockServer::start(Plan::default());
    let client = server.client();
    let models = client.list_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "m1");
    assert_eq!(client.active_model().await.unwrap().as_deref(), Some("m1"));
}

#[tokio::test]
async fn switch_model_waits_until_server_answers() {
    let server = MockServer::start(Plan::default());
    let client = server.client();

    client.switch_model("m2").await.unwrap();

    assert_eq!(server.switches(), vec!["m2"]);
    assert_eq!(client.active_model().await.unwrap().as_deref(), Some("m2"));
}

#[tokio::test]
async fn switch_model_times_out_when_server_stays_down() {
    let server = MockServer::start(Plan {
        models_down: true,
        ..Plan::default()
    });
    let client = server.client();

    let err = client.switch_model("m2").await.unwrap_err();

    assert!(
        matches!(err, LlmError::ServerRestartTimeout(d) if d == Duration::from_secs(1)),
        "{:?}",
        err
    );
}
