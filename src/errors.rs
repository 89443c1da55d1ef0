//! Error types shared across the session layer.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of the session layer.
///
/// The type is `Clone` so a single transport failure can be delivered to every
/// request that was active on the failed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure outside the engine channel.
    Io(String),
    /// The engine process could not be launched.
    Startup(String),
    /// The transport is provisioning or disconnected; retry after reconnect.
    TransportNotReady(String),
    /// The engine process terminated.
    ProcessExited {
        /// Exit code when the process exited normally.
        code: Option<i32>,
        /// Human-readable description of the exit.
        reason: String,
    },
    /// Reading from or writing to the engine channel failed.
    ChannelClosed(String),
    /// A known message kind was missing required fields.
    MalformedMessage {
        /// Discriminator of the message that failed to resolve.
        kind: String,
        /// Names of the missing or mistyped fields, or the decode error.
        fields: Vec<String>,
    },
    /// A line carried a discriminator outside the known message set.
    UnknownMessageKind(String),
    /// A single inbound line exceeded the configured frame limit.
    FrameTooLong(usize),
    /// No terminal result arrived within the configured window.
    RequestTimeout(String),
    /// The request was cancelled by its caller.
    Interrupted(String),
    /// The engine or adapter does not implement the control handshake.
    ControlNotSupported(String),
    /// The engine answered a control request with an error.
    ControlFailed(String),
    /// The admission queue is at its configured capacity.
    QueueFull(usize),
    /// Requested entity does not exist.
    NotFound(String),
    /// The outcome of a request is already claimed by another waiter.
    AlreadyConsumed(String),
    /// The session has been closed.
    Shutdown,
}

impl AppError {
    /// Whether a caller may reasonably retry the operation after reconnecting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportNotReady(_)
                | Self::ProcessExited { .. }
                | Self::ChannelClosed(_)
                | Self::RequestTimeout(_)
        )
    }

    /// Whether the error is a transport-level failure that ends every
    /// in-flight request on the connection.
    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::ProcessExited { .. } | Self::ChannelClosed(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Startup(msg) => write!(f, "startup: {msg}"),
            Self::TransportNotReady(msg) => write!(f, "transport not ready: {msg}"),
            Self::ProcessExited { code, reason } => match code {
                Some(code) => write!(f, "process exited: {reason} (code {code})"),
                None => write!(f, "process exited: {reason}"),
            },
            Self::ChannelClosed(msg) => write!(f, "channel closed: {msg}"),
            Self::MalformedMessage { kind, fields } => {
                write!(f, "malformed message: `{kind}` ({})", fields.join(", "))
            }
            Self::UnknownMessageKind(kind) => write!(f, "unknown message kind: {kind}"),
            Self::FrameTooLong(limit) => write!(f, "frame too long: exceeded {limit} bytes"),
            Self::RequestTimeout(msg) => write!(f, "request timeout: {msg}"),
            Self::Interrupted(msg) => write!(f, "interrupted: {msg}"),
            Self::ControlNotSupported(msg) => write!(f, "control not supported: {msg}"),
            Self::ControlFailed(msg) => write!(f, "control failed: {msg}"),
            Self::QueueFull(cap) => write!(f, "queue full: {cap} requests pending"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyConsumed(msg) => write!(f, "already consumed: {msg}"),
            Self::Shutdown => write!(f, "session shut down"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
