//! Single-flight FIFO admission.

use agent_conduit::session::DeliveryMode;

use super::test_helpers::{assistant_text, options, result, Harness};

/// With A in flight, B is queued and not written; B is admitted only after
/// A's result, and A's messages never reach B.
#[tokio::test]
async fn second_query_waits_for_first_result() {
    let mut h = Harness::start(options()).await;

    let a = h
        .session
        .query("A", DeliveryMode::Blocking)
        .await
        .expect("submit A");
    let (bound_a, frame_a) = h.next_query().await;
    assert_eq!(bound_a, a.as_str());
    assert_eq!(frame_a["message"]["content"], "A");

    let b = h
        .session
        .query("B", DeliveryMode::Streaming)
        .await
        .expect("submit B");
    h.assert_no_write().await;

    let stats = h.session.stats().await.expect("stats");
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.active, 2);
    assert_eq!(stats.in_flight.as_ref(), Some(&a));

    h.transport.emit(assistant_text("for A")).await;
    h.transport.emit(result("A done", "sess-1")).await;

    let outcome = h.session.wait(&a).await.expect("A completes");
    assert_eq!(outcome.text(), Some("A done"));

    let (bound_b, frame_b) = h.next_query().await;
    assert_eq!(bound_b, b.as_str());
    assert_eq!(frame_b["message"]["content"], "B");

    h.transport.emit(assistant_text("for B")).await;
    let first = h.session.pull(&b).await.expect("pull").expect("message");
    match first {
        agent_conduit::protocol::Message::AgentTurn(turn) => assert_eq!(turn.text(), "for B"),
        other => panic!("B received {other:?}"),
    }
}

/// Queued requests are written strictly in submission order.
#[tokio::test]
async fn queued_requests_are_admitted_in_order() {
    let mut h = Harness::start(options()).await;

    let ids = [
        h.session.query("1", DeliveryMode::Blocking).await.expect("1"),
        h.session.query("2", DeliveryMode::Blocking).await.expect("2"),
        h.session.query("3", DeliveryMode::Blocking).await.expect("3"),
    ];

    for (turn, id) in ids.iter().enumerate() {
        let (bound, frame) = h.next_query().await;
        assert_eq!(&bound, id.as_str(), "turn {turn} admitted out of order");
        h.assert_no_write().await;
        h.transport
            .emit(result(frame["message"]["content"].as_str().unwrap(), "sess-1"))
            .await;
    }

    for (expected, id) in ["1", "2", "3"].iter().zip(&ids) {
        let outcome = h.session.wait(id).await.expect("completes");
        assert_eq!(outcome.text(), Some(*expected));
    }
}

/// A message arriving with nothing in flight is dropped, not misrouted to the
/// next admitted request.
#[tokio::test]
async fn messages_without_a_request_in_flight_are_dropped() {
    let mut h = Harness::start(options()).await;
    h.transport.emit(assistant_text("orphan")).await;

    let id = h
        .session
        .query("fresh", DeliveryMode::Streaming)
        .await
        .expect("submit");
    h.next_query().await;
    h.transport.emit(assistant_text("mine")).await;

    let message = h.session.pull(&id).await.expect("pull").expect("message");
    match message {
        agent_conduit::protocol::Message::AgentTurn(turn) => assert_eq!(turn.text(), "mine"),
        other => panic!("unexpected {other:?}"),
    }
}
