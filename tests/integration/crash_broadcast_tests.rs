//! Transport failures broadcast to active requests, and reconnect.

use std::sync::atomic::Ordering;

use agent_conduit::session::{DeliveryMode, SessionOptions};
use agent_conduit::transport::TransportState;
use agent_conduit::AppError;

use super::test_helpers::{options, result, Harness, STEP};

fn exited() -> AppError {
    AppError::ProcessExited {
        code: Some(1),
        reason: "process exited with code 1: boom".into(),
    }
}

/// An engine crash fails both the in-flight and the queued request with the
/// same structured error.
#[tokio::test]
async fn crash_fails_every_active_request() {
    let mut h = Harness::start(options()).await;

    let a = h
        .session
        .query("A", DeliveryMode::Blocking)
        .await
        .expect("submit A");
    h.next_query().await;
    let b = h
        .session
        .query("B", DeliveryMode::Streaming)
        .await
        .expect("submit B");

    h.transport.crash(exited()).await;

    let err_a = tokio::time::timeout(STEP, h.session.wait(&a))
        .await
        .expect("A settles")
        .expect_err("A fails");
    assert_eq!(err_a, exited());

    let err_b = h.session.pull(&b).await.expect_err("B fails");
    assert_eq!(err_b, exited());
    assert!(err_b.is_retryable());

    let stats = h.session.stats().await.expect("stats");
    assert_eq!(stats.active, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, None);
}

/// After a crash the next submission restarts the transport on a new
/// generation and is admitted there.
#[tokio::test]
async fn submission_after_crash_reconnects() {
    let mut h = Harness::start(options()).await;
    assert_eq!(h.transport.starts.load(Ordering::SeqCst), 1);

    let first = h
        .session
        .query("before", DeliveryMode::Blocking)
        .await
        .expect("submit");
    h.next_query().await;
    h.transport.crash(exited()).await;
    h.session.wait(&first).await.expect_err("crashed");

    let second = h
        .session
        .query("after", DeliveryMode::Blocking)
        .await
        .expect("submit after crash");
    let (bound, frame) = h.next_query().await;
    assert_eq!(bound, second.as_str());
    assert_eq!(frame["message"]["content"], "after");
    assert_eq!(h.transport.starts.load(Ordering::SeqCst), 2);

    h.transport.emit(result("ok", "sess-2")).await;
    let outcome = h.session.wait(&second).await.expect("second succeeds");
    assert_eq!(outcome.text(), Some("ok"));

    let stats = h.session.stats().await.expect("stats");
    assert_eq!(stats.generation, 2);
    assert_eq!(stats.transport_state, TransportState::Ready);
}

/// A failed restart reports `Startup` to the request that triggered it, and
/// a later submission tries again.
#[tokio::test]
async fn failed_restart_reports_startup_error() {
    let mut h = Harness::start(options()).await;
    h.transport.crash(exited()).await;
    h.transport.fail_next_start();

    let doomed = h
        .session
        .query("doomed", DeliveryMode::Blocking)
        .await
        .expect("queued while disconnected");
    let err = tokio::time::timeout(STEP, h.session.wait(&doomed))
        .await
        .expect("settles")
        .expect_err("startup fails");
    assert!(matches!(err, AppError::Startup(_)), "got {err:?}");

    let retry = h
        .session
        .query("retry", DeliveryMode::Blocking)
        .await
        .expect("submit retry");
    let (bound, _) = h.next_query().await;
    assert_eq!(bound, retry.as_str());
    assert_eq!(h.transport.starts.load(Ordering::SeqCst), 3);
}

/// With reconnect disabled, a disconnected session refuses new work.
#[tokio::test]
async fn disconnected_without_reconnect_refuses_submission() {
    let h = Harness::start(SessionOptions {
        reconnect: false,
        ..options()
    })
    .await;
    h.transport.crash(exited()).await;

    let err = h
        .session
        .query("nope", DeliveryMode::Blocking)
        .await
        .expect_err("not ready");
    assert!(matches!(err, AppError::TransportNotReady(_)), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(h.transport.starts.load(Ordering::SeqCst), 1);
}
