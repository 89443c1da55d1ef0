//! Tool invocation correlation through a live session.

use std::sync::Arc;

use serde_json::json;

use agent_conduit::audit::AuditLogger;
use agent_conduit::session::{DeliveryMode, RequestId};
use agent_conduit::Session;

use super::test_helpers::{
    assistant_text, assistant_tool_use, options, result, text_delta, user_tool_result, Harness,
    RecordingLogger,
};

async fn audited() -> (Harness, Arc<RecordingLogger>) {
    let logger = Arc::new(RecordingLogger::default());
    let sink: Arc<dyn AuditLogger> = logger.clone();
    let h = Harness::start(options().with_audit_logger(sink)).await;
    (h, logger)
}

/// Pull one message so the registry has routed everything emitted before it.
async fn drain_one(session: &Session, id: &RequestId) {
    session
        .pull(id)
        .await
        .expect("pull")
        .expect("a message is buffered");
}

/// An invocation and its result separated by unrelated messages produce
/// exactly one audit event.
#[tokio::test]
async fn invocation_and_result_emit_one_event() {
    let (mut h, logger) = audited().await;
    let id = h
        .session
        .query("list files", DeliveryMode::Streaming)
        .await
        .expect("submit");
    h.next_query().await;

    h.transport
        .emit(assistant_tool_use("t1", "Bash", json!({"command": "ls"})))
        .await;
    drain_one(&h.session, &id).await;
    for line in [
        assistant_text("thinking about it"),
        text_delta(0, "..."),
        assistant_text("still going"),
    ] {
        h.transport.emit(line).await;
        drain_one(&h.session, &id).await;
    }

    let stats = h.session.stats().await.expect("stats");
    assert_eq!(stats.pending_tool_invocations, 1);
    assert_eq!(stats.audit_events_emitted, 0);
    assert!(logger.events.lock().unwrap().is_empty());

    h.transport.emit(user_tool_result("t1", "a.txt\nb.txt")).await;
    drain_one(&h.session, &id).await;

    let stats = h.session.stats().await.expect("stats");
    assert_eq!(stats.pending_tool_invocations, 0);
    assert_eq!(stats.audit_events_emitted, 1);
    assert_eq!(stats.audit_events_dropped, 0);

    h.transport.emit(result("done", "sess-1")).await;
    drain_one(&h.session, &id).await;
    h.session.close().await.expect("close flushes audit");

    let events = logger.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.tool_use_id, "t1");
    assert_eq!(event.tool_name, "Bash");
    assert_eq!(event.request_id, id.as_str());
    assert_eq!(event.session_id.as_deref(), Some("sess-1"));
    assert_eq!(event.input, json!({"command": "ls"}));
    assert_eq!(event.result, json!("a.txt\nb.txt"));
    assert!(!event.is_error);
    assert!(event.completed_at >= event.started_at);
    assert!(event.duration_ms >= 0);
}

/// Invocations left without a result are discarded when their request ends.
#[tokio::test]
async fn unmatched_invocations_are_released_with_request() {
    let (mut h, logger) = audited().await;
    let id = h
        .session
        .query("half", DeliveryMode::Streaming)
        .await
        .expect("submit");
    h.next_query().await;

    h.transport
        .emit(assistant_tool_use("t2", "Read", json!({"path": "x"})))
        .await;
    drain_one(&h.session, &id).await;
    assert_eq!(
        h.session.stats().await.expect("stats").pending_tool_invocations,
        1
    );

    h.transport.emit(result("gave up", "sess-1")).await;
    drain_one(&h.session, &id).await;
    assert_eq!(
        h.session.stats().await.expect("stats").pending_tool_invocations,
        0
    );

    h.session.close().await.expect("close");
    assert!(logger.events.lock().unwrap().is_empty());
}

/// Without an audit sink nothing is tracked.
#[tokio::test]
async fn no_sink_means_no_tracking() {
    let mut h = Harness::start(options()).await;
    let id = h
        .session
        .query("quiet", DeliveryMode::Streaming)
        .await
        .expect("submit");
    h.next_query().await;

    h.transport
        .emit(assistant_tool_use("t3", "Bash", json!({})))
        .await;
    drain_one(&h.session, &id).await;
    h.transport.emit(user_tool_result("t3", "ok")).await;
    drain_one(&h.session, &id).await;

    let stats = h.session.stats().await.expect("stats");
    assert_eq!(stats.pending_tool_invocations, 0);
    assert_eq!(stats.audit_events_emitted, 0);
}
