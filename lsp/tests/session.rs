//! End-to-end tests against the scripted `strand-fake-server` binary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use strand_lsp::{
    Awaited, DiagnosticEvent, LspError, ProcessState, RequestId, ResponsePayload, ServerConfig,
    Session, SessionState, Timeouts,
};
use tokio::sync::mpsc;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

fn fake_server(args: &[&str]) -> ServerConfig {
    ServerConfig::new(env!("CARGO_BIN_EXE_strand-fake-server"))
        .with_args(args.iter().copied())
        .with_timeouts(Timeouts {
            initialize_ms: 5_000,
            request_ms: 2_000,
            shutdown_ms: 500,
            grace_ms: 500,
        })
}

fn workspace_root() -> Url {
    Url::from_directory_path(std::env::temp_dir()).unwrap()
}

async fn ready_session(args: &[&str]) -> Session {
    let session = Session::start(fake_server(args)).unwrap();
    session
        .initialize(json!({}), &workspace_root())
        .await
        .unwrap();
    session.notify_initialized().await.unwrap();
    session
}

/// Pull diagnostics until `pred` matches one.
async fn expect_event(
    rx: &mut mpsc::UnboundedReceiver<DiagnosticEvent>,
    pred: impl Fn(&DiagnosticEvent) -> bool,
) -> DiagnosticEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("diagnostics sink closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected diagnostic event never arrived")
}

fn result(payload: ResponsePayload) -> serde_json::Value {
    payload.into_result().unwrap()
}

#[tokio::test]
async fn test_handshake_and_document_symbol() {
    let session = Session::start(fake_server(&[])).unwrap();
    let mut diagnostics = session.diagnostics().await;
    let mut log_messages = session.on_notification("window/logMessage").await;

    let init = session
        .initialize(json!({ "textDocument": {} }), &workspace_root())
        .await
        .unwrap();
    assert_eq!(init["serverInfo"]["name"], "strand-fake-server");
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(
        session.server_capabilities().unwrap()["documentSymbolProvider"],
        true
    );

    session.notify_initialized().await.unwrap();
    let log = tokio::time::timeout(WAIT, log_messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.params.unwrap()["message"], "fake server ready");

    let uri = "file:///tmp/lib.rs";
    session
        .notify(
            "textDocument/didOpen",
            Some(json!({
                "textDocument": { "uri": uri, "languageId": "rust", "version": 1, "text": "" }
            })),
        )
        .await
        .unwrap();
    let symbols = session
        .call_default(
            "textDocument/documentSymbol",
            Some(json!({ "textDocument": { "uri": uri } })),
        )
        .await
        .unwrap();
    assert_eq!(result(symbols), json!([]));

    let stderr = expect_event(&mut diagnostics, |e| {
        matches!(e, DiagnosticEvent::Stderr(line) if line.contains("documentSymbol"))
    })
    .await;
    assert!(matches!(stderr, DiagnosticEvent::Stderr(line) if line.contains(uri)));

    session.shutdown_and_exit().await.unwrap();
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(session.process_state(), ProcessState::Exited);
}

#[tokio::test]
async fn test_initialize_error_is_handshake_failure() {
    let config = fake_server(&[]).with_initialization_options(json!({ "fail": true }));
    let session = Session::start(config).unwrap();

    let err = session
        .initialize(json!({}), &workspace_root())
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        LspError::HandshakeFailure(msg) if msg.contains("initialization refused")
    ));
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(session.server_capabilities().is_none());
    assert_eq!(session.process_state(), ProcessState::Running);

    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_second_initialize_rejected() {
    let session = ready_session(&[]).await;
    let err = session
        .initialize(json!({}), &workspace_root())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LspError::InvalidState {
            operation: "initialize",
            state: SessionState::Ready
        }
    ));
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_malformed_header_is_skipped() {
    let session = ready_session(&[]).await;
    let mut diagnostics = session.diagnostics().await;

    let payload = session.call_default("test/garbage", None).await.unwrap();
    assert_eq!(result(payload), json!("after garbage"));
    expect_event(&mut diagnostics, |e| matches!(e, DiagnosticEvent::FrameError(_))).await;

    // The stream stays usable.
    let payload = session
        .call_default("test/echo", Some(json!({ "n": 1 })))
        .await
        .unwrap();
    assert_eq!(result(payload), json!({ "n": 1 }));
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_responses_in_reverse_order() {
    let session = ready_session(&[]).await;

    let first = session.request("test/hold", None).await.unwrap();
    let second = session.request("test/hold", None).await.unwrap();
    let first_id = first.id().clone();
    let second_id = second.id().clone();

    let released = session.call_default("test/release", None).await.unwrap();
    assert_eq!(result(released), json!("released"));

    for (slot, id) in [(second, second_id), (first, first_id)] {
        let Awaited::Ready(response) = session.await_response(slot, WAIT).await.unwrap() else {
            panic!("held request {id} timed out");
        };
        assert_eq!(response.id.as_ref(), Some(&id));
        assert_eq!(result(response.payload), json!(format!("held {id}")));
    }
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_zero_timeout_then_late_response() {
    let session = ready_session(&[]).await;

    let slot = session
        .request("test/late", Some(json!({ "delay_ms": 200 })))
        .await
        .unwrap();
    let Awaited::TimedOut(slot) = session
        .await_response(slot, Duration::ZERO)
        .await
        .unwrap()
    else {
        panic!("response cannot have arrived yet");
    };

    let Awaited::Ready(response) = session.await_response(slot, WAIT).await.unwrap() else {
        panic!("late response never arrived");
    };
    assert_eq!(result(response.payload), json!("late"));
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_call_timeout_reports_late_response() {
    let session = ready_session(&[]).await;
    let mut diagnostics = session.diagnostics().await;

    let err = session
        .call(
            "test/late",
            Some(json!({ "delay_ms": 300 })),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
    let LspError::TimedOut { id, method, .. } = err else {
        panic!("expected TimedOut, got {err:?}");
    };
    assert_eq!(method, "test/late");

    let event = expect_event(&mut diagnostics, |e| {
        matches!(e, DiagnosticEvent::LateResponse { .. })
    })
    .await;
    let DiagnosticEvent::LateResponse {
        id: late_id,
        method,
        waited,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(late_id, id);
    assert_eq!(method, "test/late");
    assert!(waited >= Duration::from_millis(300));
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_unmatched_response_is_diagnostic_only() {
    let session = ready_session(&[]).await;
    let mut diagnostics = session.diagnostics().await;

    let payload = session.call_default("test/unmatched", None).await.unwrap();
    assert_eq!(result(payload), json!("real"));

    let event = expect_event(&mut diagnostics, |e| {
        matches!(e, DiagnosticEvent::UnmatchedResponse { .. })
    })
    .await;
    assert_eq!(
        event,
        DiagnosticEvent::UnmatchedResponse {
            id: Some(RequestId::Number(999_999)),
            payload: ResponsePayload::Result(json!("bogus")),
        }
    );
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_remote_error_is_a_payload() {
    let session = ready_session(&[]).await;
    let payload = session.call_default("test/error", None).await.unwrap();
    let ResponsePayload::Error(err) = payload else {
        panic!("expected error payload");
    };
    assert_eq!(err.code, -32001);

    let payload = session.call_default("test/nope", None).await.unwrap();
    assert!(matches!(payload, ResponsePayload::Error(e) if e.code == -32601));
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_server_request_round_trip() {
    let session = ready_session(&[]).await;
    let mut requests = session.on_server_request().await;
    let mut answered = session.on_notification("test/gotResponse").await;

    session
        .call_default("test/serverRequest", None)
        .await
        .unwrap();
    let request = tokio::time::timeout(WAIT, requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.method, "workspace/configuration");
    assert_eq!(request.id, RequestId::from("srv-1"));

    session
        .respond(request.id, ResponsePayload::Result(json!([{ "x": 1 }])))
        .await
        .unwrap();
    let ack = tokio::time::timeout(WAIT, answered.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.params, Some(json!([{ "x": 1 }])));
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_responses() {
    let session = Arc::new(ready_session(&[]).await);

    let mut tasks = Vec::new();
    for n in 0..8 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            let payload = session
                .call_default("test/echo", Some(json!({ "n": n })))
                .await
                .unwrap();
            (n, result(payload))
        }));
    }
    for task in tasks {
        let (n, value) = task.await.unwrap();
        assert_eq!(value, json!({ "n": n }));
    }
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_pending_requests_fail_when_server_exits() {
    let session = ready_session(&[]).await;
    let mut diagnostics = session.diagnostics().await;

    let slot = session.request("test/silent", None).await.unwrap();
    session.notify("exit", None).await.unwrap();

    let err = session.await_response(slot, WAIT).await.unwrap_err();
    assert!(matches!(err, LspError::TransportClosed));
    expect_event(&mut diagnostics, |e| *e == DiagnosticEvent::StdoutClosed).await;

    let err = session.call_default("test/echo", None).await.unwrap_err();
    assert!(matches!(err, LspError::TransportClosed));

    // Teardown of an already-dead server still succeeds.
    session.shutdown_and_exit().await.unwrap();
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_teardown_of_exited_server_is_idempotent() {
    let session = Session::start(fake_server(&["--exit-immediately"])).unwrap();

    let status = session.shutdown_and_exit().await.unwrap();
    assert!(status.is_some_and(|s| s.success()));
    assert_eq!(session.state(), SessionState::Terminated);

    let again = session.shutdown_and_exit().await.unwrap();
    assert_eq!(again, status);
}

#[cfg(unix)]
#[tokio::test]
async fn test_stubborn_server_is_killed() {
    let session = ready_session(&["--ignore-sigterm", "--hang-on-shutdown"]).await;

    let status = tokio::time::timeout(Duration::from_secs(10), session.shutdown_and_exit())
        .await
        .expect("teardown must be bounded")
        .unwrap();
    assert!(status.is_some_and(|s| !s.success()));
    assert_eq!(session.process_state(), ProcessState::Exited);
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_abandoned_request_is_forgotten() {
    let session = ready_session(&[]).await;

    let slot = session.request("test/silent", None).await.unwrap();
    assert!(session.abandon(slot.id()).await);
    assert!(!session.abandon(slot.id()).await);
    assert!(matches!(
        session.await_response(slot, WAIT).await,
        Err(LspError::TransportClosed)
    ));

    // The session keeps working after an abandoned request.
    let payload = session.call_default("test/echo", Some(json!(1))).await.unwrap();
    assert_eq!(result(payload), json!(1));
    session.shutdown_and_exit().await.unwrap();
}

#[tokio::test]
async fn test_timed_out_call_stays_pending_until_abandoned() {
    let session = ready_session(&[]).await;

    let err = session
        .call("test/silent", None, Duration::from_millis(50))
        .await
        .unwrap_err();
    let LspError::TimedOut { id, .. } = err else {
        panic!("expected TimedOut, got {err:?}");
    };
    assert_eq!(session.pending_count().await, 1);

    assert!(session.abandon(&id).await);
    assert_eq!(session.pending_count().await, 0);
    session.shutdown_and_exit().await.unwrap();
}

/// A server that never reads stdin: large writes fill the pipe and block.
#[cfg(unix)]
#[tokio::test]
async fn test_server_that_stops_reading_cannot_stall_the_client() {
    let config = ServerConfig::new("sleep")
        .with_args(["60"])
        .with_timeouts(Timeouts {
            initialize_ms: 500,
            request_ms: 500,
            shutdown_ms: 500,
            grace_ms: 500,
        });
    let session = Session::start(config).unwrap();

    let params = json!({ "padding": "x".repeat(1024 * 1024) });
    let outcome = tokio::time::timeout(WAIT, session.initialize_with(params))
        .await
        .expect("initialize ignored its timeout");
    assert!(matches!(outcome, Err(LspError::HandshakeFailure(_))));
    assert_eq!(session.state(), SessionState::Uninitialized);

    tokio::time::timeout(Duration::from_secs(10), session.shutdown_and_exit())
        .await
        .expect("teardown must be bounded")
        .unwrap();
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(session.process_state(), ProcessState::Exited);
}
