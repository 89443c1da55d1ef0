//! Blocking queries through the request registry.

use serde_json::json;

use agent_conduit::protocol::Message;
use agent_conduit::session::{DeliveryMode, SessionOptions};
use agent_conduit::AppError;

use super::test_helpers::{assistant_text, init, options, result, Harness, STEP};

/// Submitting "2+2" against an engine that answers `Init`, an assistant turn
/// with "4", and a success result returns "4" to the blocking caller.
#[tokio::test]
async fn blocking_query_returns_result_text() {
    let mut h = Harness::start(options()).await;

    let id = h
        .session
        .query("2+2", DeliveryMode::Blocking)
        .await
        .expect("submit");

    let (bound, frame) = h.next_query().await;
    assert_eq!(bound, id.as_str());
    assert_eq!(frame["type"], "user");
    assert_eq!(frame["message"]["role"], "user");
    assert_eq!(frame["message"]["content"], "2+2");
    assert_eq!(frame["session_id"], "default");
    assert_eq!(frame["parent_tool_use_id"], json!(null));

    h.transport.emit(init("sess-1")).await;
    h.transport.emit(assistant_text("4")).await;
    h.transport.emit(result("4", "sess-1")).await;

    let outcome = tokio::time::timeout(STEP, h.session.wait(&id))
        .await
        .expect("wait in time")
        .expect("query succeeds");

    assert_eq!(outcome.text(), Some("4"));
    assert!(outcome.is_success());
    assert_eq!(outcome.request_id, id);
    assert!(
        outcome.messages.is_empty(),
        "intermediate messages are dropped unless verbose"
    );
    assert_eq!(outcome.result.total_cost_usd, Some(0.001));
}

/// With `verbose` on, the blocking outcome carries every intermediate message
/// in arrival order.
#[tokio::test]
async fn verbose_blocking_query_keeps_intermediate_messages() {
    let mut h = Harness::start(SessionOptions {
        verbose: true,
        ..options()
    })
    .await;

    let id = h
        .session
        .query("hello", DeliveryMode::Blocking)
        .await
        .expect("submit");
    h.next_query().await;

    h.transport.emit(init("sess-1")).await;
    h.transport.emit(assistant_text("hi")).await;
    h.transport.emit(result("hi", "sess-1")).await;

    let outcome = h.session.wait(&id).await.expect("query succeeds");
    assert_eq!(outcome.messages.len(), 2);
    assert!(matches!(outcome.messages[0], Message::Init(_)));
    assert!(matches!(&outcome.messages[1], Message::AgentTurn(turn) if turn.text() == "hi"));
}

/// The engine session id announced by `Init` is stamped on later user frames
/// and exposed on the session handle.
#[tokio::test]
async fn engine_session_id_is_tracked_and_stamped() {
    let mut h = Harness::start(options()).await;
    assert_eq!(h.session.engine_session_id(), None);

    let first = h
        .session
        .query("one", DeliveryMode::Blocking)
        .await
        .expect("submit");
    h.next_query().await;
    h.transport.emit(init("sess-42")).await;
    h.transport.emit(result("done", "sess-42")).await;
    h.session.wait(&first).await.expect("first query");

    assert_eq!(h.session.engine_session_id().as_deref(), Some("sess-42"));

    let _second = h
        .session
        .query("two", DeliveryMode::Blocking)
        .await
        .expect("submit");
    let (_, frame) = h.next_query().await;
    assert_eq!(frame["session_id"], "sess-42");
}

/// Waiting on an unknown request id is a `NotFound` error, not a hang.
#[tokio::test]
async fn wait_on_unknown_request_is_not_found() {
    let h = Harness::start(options()).await;
    let err = h
        .session
        .wait(&"req_missing".into())
        .await
        .expect_err("unknown request");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
}

/// An outcome that arrives before anyone waits is kept for the first waiter.
#[tokio::test]
async fn outcome_before_wait_is_kept() {
    let mut h = Harness::start(options()).await;
    let id = h
        .session
        .query("early", DeliveryMode::Blocking)
        .await
        .expect("submit");
    h.next_query().await;
    h.transport.emit(result("early", "sess-1")).await;

    // Let the registry record the result before waiting.
    let stats = loop {
        let stats = h.session.stats().await.expect("stats");
        if stats.in_flight.is_none() {
            break stats;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(stats.active, 0);

    let outcome = h.session.wait(&id).await.expect("outcome kept");
    assert_eq!(outcome.text(), Some("early"));

    let err = h.session.wait(&id).await.expect_err("outcome consumed");
    assert!(matches!(err, AppError::NotFound(_)));
}

/// A full admission queue rejects new submissions instead of dropping them.
#[tokio::test]
async fn full_queue_rejects_submission() {
    let mut h = Harness::start(SessionOptions {
        max_queued_requests: 1,
        ..options()
    })
    .await;

    h.session
        .query("in flight", DeliveryMode::Blocking)
        .await
        .expect("first is admitted");
    h.next_query().await;
    h.session
        .query("queued", DeliveryMode::Blocking)
        .await
        .expect("second is queued");

    let err = h
        .session
        .query("overflow", DeliveryMode::Blocking)
        .await
        .expect_err("queue is full");
    assert_eq!(err, AppError::QueueFull(1));
}

/// Closing the session fails outstanding requests with `Shutdown` and stops
/// the transport; later calls report `Shutdown`.
#[tokio::test]
async fn close_fails_outstanding_requests() {
    let mut h = Harness::start(options()).await;
    let id = h
        .session
        .query("never answered", DeliveryMode::Blocking)
        .await
        .expect("submit");
    h.next_query().await;

    let waiter = {
        let session = &h.session;
        async move { session.wait(&id).await }
    };
    let (outcome, closed) = tokio::join!(waiter, async {
        tokio::task::yield_now().await;
        h.session.close().await
    });

    closed.expect("close");
    let err = outcome.expect_err("request failed by shutdown");
    assert_eq!(err, AppError::Shutdown);
    assert_eq!(
        h.transport.stops.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    let err = h
        .session
        .query("after close", DeliveryMode::Blocking)
        .await
        .expect_err("closed");
    assert_eq!(err, AppError::Shutdown);

    h.session.close().await.expect("close is idempotent");
}

/// Only one caller may wait on a blocking request; a second waiter is turned
/// away while the first still receives the outcome.
#[tokio::test]
async fn second_waiter_is_already_consumed() {
    let mut h = Harness::start(options()).await;
    let id = h
        .session
        .query("2+2", DeliveryMode::Blocking)
        .await
        .expect("submit");
    h.next_query().await;

    let both = async {
        tokio::join!(h.session.wait(&id), async {
            let second = h.session.wait(&id).await;
            h.transport.emit(result("4", "sess-1")).await;
            second
        })
    };
    let (first, second) = tokio::time::timeout(STEP, both).await.expect("in time");

    let err = second.expect_err("outcome already claimed");
    assert!(matches!(err, AppError::AlreadyConsumed(_)), "got {err:?}");
    let outcome = first.expect("first waiter gets the result");
    assert_eq!(outcome.text(), Some("4"));
}
