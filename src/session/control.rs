//! Control-protocol channel.
//!
//! A correlation table keyed by control request identifiers, independent of
//! the query registry. Control frames bypass FIFO admission so a model switch
//! or an interrupt is never stuck behind an in-flight query.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::message::{ControlRequestMessage, ControlResponseMessage};
use crate::protocol::outbound::{
    encode_control_request, encode_control_response, encode_custom_control_request,
    ControlRequestBody,
};
use crate::transport::Transport;
use crate::{AppError, Result};

/// Capacity of the inbound control request subscription.
const SUBSCRIPTION_CAPACITY: usize = 32;

/// Engine permission modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Ask before every sensitive tool.
    Default,
    /// Accept file edits without asking.
    AcceptEdits,
    /// Plan only; no tool execution.
    Plan,
    /// Skip every permission prompt.
    BypassPermissions,
}

impl PermissionMode {
    /// Wire name of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

impl Display for PermissionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type ControlReply = oneshot::Sender<Result<Value>>;
type PendingMap = HashMap<String, (String, ControlReply)>;

/// Removes a pending entry when its `exchange` ends, including when the
/// caller drops the future early.
struct PendingEntry<'a> {
    pending: &'a Mutex<PendingMap>,
    request_id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if lock(self.pending).remove(self.request_id).is_some() {
            debug!(request_id = self.request_id, "pending control request released");
        }
    }
}

/// Control-protocol channel over a shared transport.
pub struct ControlChannel {
    transport: Arc<dyn Transport>,
    enabled: bool,
    timeout: Duration,
    pending: Mutex<PendingMap>,
    subscriber: Mutex<Option<mpsc::Sender<ControlRequestMessage>>>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Build a channel; with `enabled` off every request returns
    /// [`AppError::ControlNotSupported`].
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, enabled: bool, timeout: Duration) -> Self {
        Self {
            transport,
            enabled,
            timeout,
            pending: Mutex::new(HashMap::new()),
            subscriber: Mutex::new(None),
        }
    }

    /// Whether the control handshake is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Control requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    // ── Client-initiated requests ───────────────────────────

    /// Ask the engine to stop the in-progress turn.
    ///
    /// # Errors
    ///
    /// See [`ControlChannel::request`].
    pub async fn interrupt(&self) -> Result<Value> {
        self.request(ControlRequestBody::Interrupt).await
    }

    /// Switch the active model; `None` restores the engine default.
    ///
    /// # Errors
    ///
    /// See [`ControlChannel::request`].
    pub async fn set_model(&self, model: Option<String>) -> Result<Value> {
        self.request(ControlRequestBody::SetModel { model }).await
    }

    /// Change the permission mode.
    ///
    /// # Errors
    ///
    /// See [`ControlChannel::request`].
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<Value> {
        self.request(ControlRequestBody::SetPermissionMode {
            mode: mode.as_str().to_owned(),
        })
        .await
    }

    /// Run the control handshake. The response describes engine capabilities.
    ///
    /// # Errors
    ///
    /// See [`ControlChannel::request`].
    pub async fn initialize(&self) -> Result<Value> {
        self.request(ControlRequestBody::Initialize { hooks: None })
            .await
    }

    /// Send a typed control request and wait for its response.
    ///
    /// # Errors
    ///
    /// - [`AppError::ControlNotSupported`] if the handshake is disabled or the
    ///   engine does not recognize the subtype.
    /// - [`AppError::ControlFailed`] if the engine answered with an error.
    /// - [`AppError::RequestTimeout`] if no response arrived in time.
    /// - Transport errors from writing the frame.
    pub async fn request(&self, body: ControlRequestBody) -> Result<Value> {
        let subtype = subtype_of(&body);
        self.exchange(subtype, |request_id| {
            encode_control_request(request_id, &body)
        })
        .await
    }

    /// Send a control request with an arbitrary subtype and fields.
    ///
    /// # Errors
    ///
    /// Same as [`ControlChannel::request`].
    pub async fn request_custom(&self, subtype: &str, fields: Map<String, Value>) -> Result<Value> {
        self.exchange(subtype.to_owned(), |request_id| {
            encode_custom_control_request(request_id, subtype, fields)
        })
        .await
    }

    async fn exchange(
        &self,
        subtype: String,
        encode: impl FnOnce(&str) -> Result<Value>,
    ) -> Result<Value> {
        if !self.enabled {
            return Err(AppError::ControlNotSupported(format!(
                "{subtype}: control protocol disabled"
            )));
        }

        let request_id = format!("ctl_{}", Uuid::new_v4().simple());
        let frame = encode(&request_id)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), (subtype.clone(), tx));
        let _entry = PendingEntry {
            pending: &self.pending,
            request_id: &request_id,
        };

        debug!(%request_id, %subtype, "sending control request");
        self.transport.send_control(frame).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AppError::ChannelClosed(format!(
                "control request {request_id} abandoned"
            ))),
            Err(_) => {
                warn!(%request_id, %subtype, "control request timed out");
                Err(AppError::RequestTimeout(format!(
                    "control request {subtype} ({request_id})"
                )))
            }
        }
    }

    /// Route an engine response to its waiter.
    ///
    /// Returns `false` when no request with that identifier is pending.
    pub fn resolve(&self, response: ControlResponseMessage) -> bool {
        let Some((subtype, reply)) = lock(&self.pending).remove(&response.request_id) else {
            debug!(request_id = %response.request_id, "control response without pending request");
            return false;
        };

        let outcome = response.outcome.map_err(|error| classify(&subtype, &error));
        reply.send(outcome).is_ok()
    }

    /// Fail every pending control request with `error`.
    pub fn fail_all(&self, error: &AppError) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (request_id, (_, reply)) in drained {
            debug!(%request_id, "failing pending control request");
            reply.send(Err(error.clone())).ok();
        }
    }

    // ── Engine-initiated requests ───────────────────────────

    /// Take the receiver of engine-initiated control requests.
    ///
    /// Only the first call returns `Some`. Until then, and after the receiver
    /// is dropped, inbound requests are answered with an error.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<ControlRequestMessage>> {
        let mut subscriber = lock(&self.subscriber);
        if subscriber.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        *subscriber = Some(tx);
        Some(rx)
    }

    /// Answer an engine-initiated control request.
    ///
    /// # Errors
    ///
    /// Transport errors from writing the frame.
    pub async fn respond(
        &self,
        request_id: &str,
        outcome: std::result::Result<Value, String>,
    ) -> Result<()> {
        let frame = encode_control_response(request_id, &outcome)?;
        self.transport.send_control(frame).await
    }

    /// Hand an engine-initiated request to the subscriber, or refuse it.
    pub async fn dispatch_inbound(&self, request: ControlRequestMessage) {
        let subscriber = lock(&self.subscriber).clone();
        let request = match subscriber {
            Some(tx) => match tx.try_send(request) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(request)) => {
                    warn!(request_id = %request.request_id, "control subscriber is full");
                    request
                }
                Err(mpsc::error::TrySendError::Closed(request)) => request,
            },
            None => request,
        };

        info!(
            request_id = %request.request_id,
            subtype = %request.subtype,
            "no handler for engine control request, refusing"
        );
        let refusal = Err(format!("unhandled control request: {}", request.subtype));
        if let Err(err) = self.respond(&request.request_id, refusal).await {
            warn!(request_id = %request.request_id, error = %err, "failed to refuse control request");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn subtype_of(body: &ControlRequestBody) -> String {
    match body {
        ControlRequestBody::Initialize { .. } => "initialize",
        ControlRequestBody::Interrupt => "interrupt",
        ControlRequestBody::SetModel { .. } => "set_model",
        ControlRequestBody::SetPermissionMode { .. } => "set_permission_mode",
    }
    .to_owned()
}

/// Map an engine error string to the error taxonomy.
fn classify(subtype: &str, error: &str) -> AppError {
    let lowered = error.to_ascii_lowercase();
    if lowered.contains("unsupported")
        || lowered.contains("not supported")
        || lowered.contains("unknown")
    {
        AppError::ControlNotSupported(format!("{subtype}: {error}"))
    } else {
        AppError::ControlFailed(format!("{subtype}: {error}"))
    }
}
