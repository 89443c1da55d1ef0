//! Transport adapter boundary.
//!
//! A [`Transport`] owns one engine connection: it encodes outbound frames,
//! pumps inbound bytes through the framing and resolver layers, and reports
//! everything else through [`TransportEvent`]s on the channel it was built
//! with. The request registry is the only consumer of those events.
//!
//! Submodules:
//! - `spawner`: process launch with environment precedence and exit
//!   classification.
//! - `reader`: inbound pump (stdout → [`Message`]).
//! - `writer`: outbound writer (JSON value → NDJSON line on stdin).
//! - `process`: [`process::ProcessTransport`], the subprocess adapter.

pub mod process;
pub mod reader;
pub mod spawner;
pub mod writer;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::protocol::message::{ControlRequestMessage, Message};
use crate::{AppError, Result};

/// Boxed future returned by [`Transport`] operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Lifecycle state of a transport.
///
/// Transitions: `Provisioning → Ready`, `Ready → Disconnected`,
/// `Provisioning → Disconnected` (startup failure), and
/// `Disconnected → Provisioning` on an explicit reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// The engine is being launched.
    Provisioning,
    /// Frames may be submitted.
    Ready,
    /// No live connection.
    Disconnected,
}

impl Display for TransportState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Result of a transport health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Connected and accepting frames.
    Healthy,
    /// Usable soon; for example still provisioning.
    Degraded(String),
    /// Not usable.
    Unhealthy(String),
}

/// A resolved inbound message tagged with routing metadata.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Connection generation that produced the message.
    pub generation: u64,
    /// The message itself; session correlation travels inside it.
    pub message: Message,
}

/// Notifications emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A line resolved to a message.
    MessageReceived(InboundMessage),
    /// The engine initiated a control request.
    ControlRequestReceived(ControlRequestMessage),
    /// The connection failed or startup failed.
    Error {
        /// Connection generation the failure belongs to.
        generation: u64,
        /// Structured reason.
        error: AppError,
        /// Request bound to outbound writes when the failure happened.
        in_flight: Option<String>,
    },
    /// The lifecycle state changed.
    StatusChanged {
        /// Connection generation the transition belongs to.
        generation: u64,
        /// New state.
        state: TransportState,
    },
}

/// Owner of one engine connection.
///
/// Implementations must be [`Send`] and [`Sync`] so the registry, the control
/// channel, and callers can share one instance through [`std::sync::Arc`].
pub trait Transport: Send + Sync {
    /// Launch the engine: `Provisioning`, then `Ready` on success.
    ///
    /// Calling `start` on a ready transport is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Startup`] if the engine cannot be launched; the
    /// failure is also reported as a [`TransportEvent::Error`].
    fn start(&self) -> TransportFuture<'_, ()>;

    /// Write a query frame and bind `request_id` to outbound writes.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportNotReady`] unless the state is `Ready`,
    /// or [`AppError::ChannelClosed`] if the write channel is gone.
    fn submit(&self, request_id: &str, frame: Value) -> TransportFuture<'_, ()>;

    /// Write a control frame without touching the request binding.
    ///
    /// # Errors
    ///
    /// Same as [`Transport::submit`].
    fn send_control(&self, frame: Value) -> TransportFuture<'_, ()>;

    /// Terminate the engine and release the channel. Idempotent.
    ///
    /// # Errors
    ///
    /// Implementations report failures to terminate the process.
    fn stop(&self) -> TransportFuture<'_, ()>;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Generation of the current (or last) connection; 0 before the first
    /// start.
    fn generation(&self) -> u64;

    /// Health derived from the lifecycle state and the last failure.
    fn health(&self) -> Health;
}
