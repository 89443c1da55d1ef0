//! Subprocess transport against scripted `sh` engines.

#![cfg(unix)]

use serde_json::json;
use tokio::sync::mpsc;

use agent_conduit::protocol::Message;
use agent_conduit::session::SessionOptions;
use agent_conduit::transport::process::ProcessTransport;
use agent_conduit::transport::{Health, Transport, TransportEvent, TransportState};
use agent_conduit::{AppError, EngineConfig, Session};

use super::test_helpers::STEP;

const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"e2e","tools":[]}"#;
const ASSISTANT: &str = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"4"}]},"session_id":"e2e"}"#;
const RESULT: &str =
    r#"{"type":"result","subtype":"success","is_error":false,"result":"4","session_id":"e2e"}"#;

fn sh_engine(script: &str) -> EngineConfig {
    let mut config = EngineConfig {
        executable: "sh".into(),
        args: vec!["-c".into(), script.into()],
        ..EngineConfig::default()
    };
    config.timeouts.stop_grace_millis = 500;
    config
}

fn transport(script: &str) -> (ProcessTransport, mpsc::Receiver<TransportEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (ProcessTransport::from_engine_config(&sh_engine(script), tx), rx)
}

/// Collect events until the transport reports `Disconnected` after having
/// been `Ready`.
async fn until_disconnected(events: &mut mpsc::Receiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut seen = Vec::new();
    let mut was_ready = false;
    loop {
        let event = tokio::time::timeout(STEP, events.recv())
            .await
            .expect("event in time")
            .expect("transport alive");
        let done = match &event {
            TransportEvent::StatusChanged { state, .. } => {
                was_ready |= *state == TransportState::Ready;
                was_ready && *state == TransportState::Disconnected
            }
            _ => false,
        };
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn messages(events: &[TransportEvent]) -> Vec<&Message> {
    events
        .iter()
        .filter_map(|event| match event {
            TransportEvent::MessageReceived(inbound) => Some(&inbound.message),
            _ => None,
        })
        .collect()
}

fn failure(events: &[TransportEvent]) -> (&AppError, Option<&str>) {
    events
        .iter()
        .find_map(|event| match event {
            TransportEvent::Error {
                error, in_flight, ..
            } => Some((error, in_flight.as_deref())),
            _ => None,
        })
        .expect("an error event")
}

/// Lines written before a clean exit are delivered before the disconnect,
/// and the terminal result clears the request binding.
#[tokio::test]
async fn clean_exit_after_result() {
    let script = format!("read line; printf '%s\\n' '{INIT}' '{ASSISTANT}' '{RESULT}'; exit 0");
    let (transport, mut events) = transport(&script);
    transport.start().await.expect("start");
    assert_eq!(transport.state(), TransportState::Ready);
    assert_eq!(transport.generation(), 1);

    transport
        .submit("req_1", json!({"type": "user", "message": {"role": "user", "content": "2+2"}}))
        .await
        .expect("submit");
    assert_eq!(transport.bound_request().as_deref(), Some("req_1"));

    let seen = until_disconnected(&mut events).await;
    let kinds: Vec<_> = messages(&seen).iter().map(|m| m.kind()).collect();
    assert_eq!(kinds, ["system", "assistant", "result"]);

    let (error, in_flight) = failure(&seen);
    assert!(
        matches!(error, AppError::ProcessExited { code: Some(0), .. }),
        "got {error:?}"
    );
    assert_eq!(in_flight, None);
    assert_eq!(transport.state(), TransportState::Disconnected);
}

/// A crash reports the exit code, the last stderr line, and the request that
/// was bound to the connection.
#[tokio::test]
async fn crash_reports_exit_code_and_stderr() {
    let (transport, mut events) =
        transport("read line; echo 'fatal: bad credentials' >&2; exit 3");
    transport.start().await.expect("start");
    transport
        .submit("req_2", json!({"type": "user"}))
        .await
        .expect("submit");

    let seen = until_disconnected(&mut events).await;
    let (error, in_flight) = failure(&seen);
    match error {
        AppError::ProcessExited { code, reason } => {
            assert_eq!(*code, Some(3));
            assert!(reason.contains("fatal: bad credentials"), "reason: {reason}");
        }
        other => panic!("expected ProcessExited, got {other:?}"),
    }
    assert_eq!(in_flight, Some("req_2"));
    assert!(matches!(transport.health(), Health::Unhealthy(_)));

    let err = transport
        .submit("req_3", json!({}))
        .await
        .expect_err("disconnected");
    assert!(matches!(err, AppError::TransportNotReady(_)));
}

/// `stop` ends the connection with `ChannelClosed("transport stopped")` and
/// is idempotent.
#[tokio::test]
async fn stop_closes_the_channel() {
    let (transport, mut events) = transport("cat > /dev/null");
    transport.start().await.expect("start");

    transport.stop().await.expect("stop");
    let seen = until_disconnected(&mut events).await;
    let (error, _) = failure(&seen);
    assert_eq!(
        *error,
        AppError::ChannelClosed("transport stopped".into())
    );
    assert_eq!(transport.state(), TransportState::Disconnected);

    transport.stop().await.expect("second stop is a no-op");
}

/// A stop that lands while the engine is still provisioning wins: the launch
/// is torn down, the transport never reports `Ready`, and the engine process
/// does not outlive the stop.
#[tokio::test]
async fn stop_during_provisioning_terminates_engine() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pid_file = dir.path().join("engine.pid");
    let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());

    // A full event queue parks `start` right after it enters `Provisioning`.
    let (tx, mut events) = mpsc::channel(1);
    let transport = ProcessTransport::from_engine_config(&sh_engine(&script), tx.clone());
    tx.try_send(TransportEvent::StatusChanged {
        generation: 0,
        state: TransportState::Disconnected,
    })
    .expect("fill the event queue");
    drop(tx);

    let starter = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.start().await })
    };
    tokio::time::timeout(STEP, async {
        while transport.state() != TransportState::Provisioning {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("start reaches provisioning");

    transport.stop().await.expect("stop");
    assert_eq!(transport.state(), TransportState::Disconnected);

    let drain = tokio::spawn(async move {
        let mut states = Vec::new();
        while let Some(event) = events.recv().await {
            if let TransportEvent::StatusChanged { state, .. } = event {
                states.push(state);
            }
        }
        states
    });

    let err = tokio::time::timeout(STEP, starter)
        .await
        .expect("start finishes in time")
        .expect("join")
        .expect_err("launch superseded by stop");
    assert!(matches!(err, AppError::Startup(_)), "got {err:?}");
    assert_eq!(transport.state(), TransportState::Disconnected);
    match transport.health() {
        Health::Unhealthy(reason) => assert!(reason.contains("stopped during startup"), "{reason}"),
        other => panic!("expected Unhealthy, got {other:?}"),
    }

    drop(transport);
    let states = tokio::time::timeout(STEP, drain)
        .await
        .expect("every sender dropped")
        .expect("join");
    assert!(!states.contains(&TransportState::Ready), "states: {states:?}");
    assert_eq!(states.last(), Some(&TransportState::Disconnected));

    if let Ok(pid) = std::fs::read_to_string(&pid_file) {
        let pid: i32 = pid.trim().parse().expect("pid");
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
        assert!(!alive, "engine {pid} outlived the stop");
    }
}

/// A missing executable fails startup and leaves the transport unhealthy.
#[tokio::test]
async fn missing_executable_fails_startup() {
    let (tx, mut events) = mpsc::channel(16);
    let config = EngineConfig {
        executable: "/nonexistent/conduit-engine".into(),
        ..EngineConfig::default()
    };
    let transport = ProcessTransport::from_engine_config(&config, tx);

    let err = transport.start().await.expect_err("spawn fails");
    assert!(matches!(err, AppError::Startup(_)), "got {err:?}");
    assert_eq!(transport.state(), TransportState::Disconnected);
    match transport.health() {
        Health::Unhealthy(reason) => assert!(reason.contains("failed to spawn"), "{reason}"),
        other => panic!("expected Unhealthy, got {other:?}"),
    }

    let mut states = Vec::new();
    let mut startup_error = false;
    while let Ok(event) = events.try_recv() {
        match event {
            TransportEvent::StatusChanged { state, .. } => states.push(state),
            TransportEvent::Error { error, .. } => {
                startup_error = matches!(error, AppError::Startup(_));
            }
            _ => {}
        }
    }
    assert_eq!(
        states,
        [TransportState::Provisioning, TransportState::Disconnected]
    );
    assert!(startup_error);
}

/// Noise, unknown kinds, and oversized lines are skipped without ending the
/// stream.
#[tokio::test]
async fn bad_lines_are_skipped() {
    let script = format!(
        "printf '%s\\n' 'not json' '{{\"type\":\"mystery\"}}'; \
         head -c 4096 /dev/zero | tr '\\0' 'a'; echo; \
         printf '%s\\n' '{RESULT}'"
    );
    let mut config = sh_engine(&script);
    config.session.max_line_bytes = 1024;
    let (tx, mut events) = mpsc::channel(64);
    let transport = ProcessTransport::from_engine_config(&config, tx);
    transport.start().await.expect("start");

    let seen = until_disconnected(&mut events).await;
    let kinds: Vec<_> = messages(&seen).iter().map(|m| m.kind()).collect();
    assert_eq!(kinds, ["result"]);
}

/// End to end: a session over an echo-loop engine answers blocking queries
/// in order and tracks the engine session id.
#[tokio::test]
async fn session_over_subprocess_answers_queries() {
    let script = format!(
        "while IFS= read -r line; do printf '%s\\n' '{INIT}' 'noise' '{ASSISTANT}' '{RESULT}'; done"
    );
    let session = Session::spawn(&sh_engine(&script)).await.expect("spawn");
    assert_eq!(session.health(), Health::Healthy);

    let first = tokio::time::timeout(STEP, session.query_blocking("2+2"))
        .await
        .expect("answer in time")
        .expect("query succeeds");
    assert_eq!(first.text(), Some("4"));
    assert_eq!(session.engine_session_id().as_deref(), Some("e2e"));

    let second = session.query_blocking("2+2 again").await.expect("second");
    assert!(second.is_success());

    session.close().await.expect("close");
    assert!(matches!(session.health(), Health::Unhealthy(_)));
}

/// `SessionOptions` mirror the engine configuration.
#[test]
fn session_options_follow_engine_config() {
    let mut config = sh_engine("true");
    config.session.verbose = true;
    config.timeouts.request_seconds = 0;
    let options = SessionOptions::from_engine_config(&config);
    assert!(options.verbose);
    assert_eq!(options.request_timeout, None);
    assert!(options.audit_logger.is_none());
}
