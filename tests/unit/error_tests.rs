//! Unit tests for `AppError` display format and classification.

use agent_conduit::AppError;

#[test]
fn display_prefixes_name_the_variant() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Io("disk".into()), "io: disk"),
        (AppError::Startup("no binary".into()), "startup: no binary"),
        (
            AppError::TransportNotReady("transport is provisioning".into()),
            "transport not ready: transport is provisioning",
        ),
        (
            AppError::ChannelClosed("read failed".into()),
            "channel closed: read failed",
        ),
        (
            AppError::UnknownMessageKind("mystery".into()),
            "unknown message kind: mystery",
        ),
        (
            AppError::FrameTooLong(1024),
            "frame too long: exceeded 1024 bytes",
        ),
        (
            AppError::RequestTimeout("request req_1".into()),
            "request timeout: request req_1",
        ),
        (
            AppError::Interrupted("request req_1 cancelled".into()),
            "interrupted: request req_1 cancelled",
        ),
        (
            AppError::ControlNotSupported("interrupt".into()),
            "control not supported: interrupt",
        ),
        (
            AppError::ControlFailed("set_model: busy".into()),
            "control failed: set_model: busy",
        ),
        (AppError::QueueFull(8), "queue full: 8 requests pending"),
        (AppError::NotFound("request x".into()), "not found: request x"),
        (
            AppError::AlreadyConsumed("request x already has a waiter".into()),
            "already consumed: request x already has a waiter",
        ),
        (AppError::Shutdown, "session shut down"),
    ];

    for (error, expected) in cases {
        assert_eq!(error.to_string(), expected);
        assert!(!expected.ends_with('.'), "no trailing period: {expected}");
    }
}

#[test]
fn process_exited_display_includes_code_when_known() {
    let with_code = AppError::ProcessExited {
        code: Some(3),
        reason: "process exited with code 3: fatal".into(),
    };
    assert_eq!(
        with_code.to_string(),
        "process exited: process exited with code 3: fatal (code 3)"
    );

    let signalled = AppError::ProcessExited {
        code: None,
        reason: "process terminated by signal".into(),
    };
    assert_eq!(
        signalled.to_string(),
        "process exited: process terminated by signal"
    );
}

#[test]
fn malformed_display_lists_fields() {
    let err = AppError::MalformedMessage {
        kind: "result".into(),
        fields: vec!["subtype".into(), "session_id".into()],
    };
    assert_eq!(
        err.to_string(),
        "malformed message: `result` (subtype, session_id)"
    );
}

#[test]
fn retryable_errors() {
    assert!(AppError::TransportNotReady("x".into()).is_retryable());
    assert!(AppError::ChannelClosed("x".into()).is_retryable());
    assert!(AppError::RequestTimeout("x".into()).is_retryable());
    assert!(AppError::ProcessExited {
        code: Some(1),
        reason: "x".into()
    }
    .is_retryable());

    assert!(!AppError::Config("x".into()).is_retryable());
    assert!(!AppError::Interrupted("x".into()).is_retryable());
    assert!(!AppError::ControlFailed("x".into()).is_retryable());
    assert!(!AppError::Shutdown.is_retryable());
}

#[test]
fn transport_failures() {
    assert!(AppError::ChannelClosed("x".into()).is_transport_failure());
    assert!(AppError::ProcessExited {
        code: None,
        reason: "x".into()
    }
    .is_transport_failure());
    assert!(!AppError::RequestTimeout("x".into()).is_transport_failure());
    assert!(!AppError::Startup("x".into()).is_transport_failure());
}

#[test]
fn conversions_map_to_expected_variants() {
    let io: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
    assert!(matches!(io, AppError::Io(msg) if msg.contains("pipe")));

    let json: AppError = serde_json::from_str::<serde_json::Value>("{")
        .expect_err("invalid json")
        .into();
    assert!(json.to_string().starts_with("io: json:"));

    let toml: AppError = toml::from_str::<toml::Value>("= nope")
        .expect_err("invalid toml")
        .into();
    assert!(matches!(toml, AppError::Config(msg) if msg.starts_with("invalid config:")));
}
