//! Unit tests for the inbound pump.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_conduit::protocol::Message;
use agent_conduit::transport::reader::{run_reader, ReaderExit, ReaderStats};

const MAX: usize = 4096;

async fn pump(input: &'static [u8]) -> (ReaderExit, ReaderStats, Vec<Message>) {
    let (tx, mut rx) = mpsc::channel(32);
    let (exit, stats) = run_reader(input, MAX, tx, CancellationToken::new()).await;
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    (exit, stats, messages)
}

#[tokio::test]
async fn forwards_messages_in_order_until_eof() {
    let input = concat!(
        r#"{"type":"system","subtype":"init","session_id":"s1"}"#,
        "\n",
        r#"{"type":"assistant","message":{"role":"assistant","content":"hi"}}"#,
        "\n",
        r#"{"type":"result","subtype":"success","session_id":"s1"}"#,
        "\n",
    );
    let (exit, stats, messages) = pump(input.as_bytes()).await;

    assert_eq!(exit, ReaderExit::Eof);
    assert_eq!(stats, ReaderStats { forwarded: 3, skipped: 0 });
    let kinds: Vec<_> = messages.iter().map(Message::kind).collect();
    assert_eq!(kinds, ["system", "assistant", "result"]);
}

#[tokio::test]
async fn bad_lines_are_skipped_not_fatal() {
    let input = concat!(
        "garbage\n",
        r#"{"type":"telemetry","x":1}"#,
        "\n",
        r#"{"type":"result"}"#,
        "\n",
        "\n",
        r#"{"type":"result","subtype":"success","session_id":"s1"}"#,
    );
    let (exit, stats, messages) = pump(input.as_bytes()).await;

    assert_eq!(exit, ReaderExit::Eof);
    assert_eq!(stats, ReaderStats { forwarded: 1, skipped: 3 });
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_terminal());
}

#[tokio::test]
async fn oversized_line_is_skipped() {
    let mut input = vec![b'x'; MAX + 10];
    input.push(b'\n');
    input.extend_from_slice(br#"{"type":"result","subtype":"success","session_id":"s1"}"#);
    input.push(b'\n');
    let input: &'static [u8] = Box::leak(input.into_boxed_slice());

    let (exit, stats, messages) = pump(input).await;
    assert_eq!(exit, ReaderExit::Eof);
    assert_eq!(stats.skipped, 1);
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn invalid_utf8_line_is_skipped_not_repaired() {
    let input: &[u8] = b"{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"ok\xff\",\"session_id\":\"s1\"}\n\
{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"ok\",\"session_id\":\"s1\"}\n";
    let (exit, stats, messages) = pump(input).await;

    assert_eq!(exit, ReaderExit::Eof);
    assert_eq!(stats, ReaderStats { forwarded: 1, skipped: 1 });
    match &messages[..] {
        [Message::Result(result)] => assert_eq!(result.text.as_deref(), Some("ok")),
        other => panic!("expected one result, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_reader_stops() {
    let (client, _server) = tokio::io::duplex(64);
    let (tx, _rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (exit, stats) = run_reader(client, MAX, tx, cancel).await;
    assert_eq!(exit, ReaderExit::Cancelled);
    assert_eq!(stats, ReaderStats::default());
}

#[tokio::test]
async fn closed_receiver_stops_reader() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let input: &[u8] = b"{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"s\"}\n";

    let (exit, _) = run_reader(input, MAX, tx, CancellationToken::new()).await;
    assert_eq!(exit, ReaderExit::ReceiverClosed);
}
