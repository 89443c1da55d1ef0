//! Session handle.
//!
//! A [`Session`] is the caller-facing side of the request registry. It is
//! cheap to share behind a reference: every operation is a message to the
//! registry task plus a oneshot reply.
//!
//! ```no_run
//! # async fn demo() -> agent_conduit::Result<()> {
//! use agent_conduit::{EngineConfig, Session};
//!
//! let session = Session::spawn(&EngineConfig::default()).await?;
//! let outcome = session.query_blocking("2+2").await?;
//! println!("{}", outcome.text().unwrap_or_default());
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod control;
pub mod registry;
pub mod request;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream::Stream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{spawn_audit_dispatcher, AuditLogger, JsonlAuditWriter, ToolUseCorrelator};
use crate::config::EngineConfig;
use crate::protocol::message::{ControlRequestMessage, Message};
use crate::protocol::outbound::QueryPayload;
use crate::transport::process::ProcessTransport;
use crate::transport::{Health, Transport, TransportEvent};
use crate::{AppError, Result};

pub use control::{ControlChannel, PermissionMode};
pub use registry::SessionStats;
pub use request::{DeliveryMode, QueryOutcome, RequestId, RequestStatus};

use registry::{Command, Registry, RegistrySettings};

/// Capacity of the handle → registry command queue.
const COMMAND_QUEUE_CAPACITY: usize = 128;

/// Capacity of the transport → registry event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Session tunables.
#[derive(Clone)]
pub struct SessionOptions {
    /// Bound of the admission queue.
    pub max_queued_requests: usize,
    /// Keep intermediate messages for blocking queries.
    pub verbose: bool,
    /// Restart the transport on demand after a disconnect.
    pub reconnect: bool,
    /// Whether the engine speaks the control protocol.
    pub control_protocol: bool,
    /// Per-request timeout counted from submission; `None` disables it.
    pub request_timeout: Option<Duration>,
    /// Timeout of control requests.
    pub control_timeout: Duration,
    /// Bound of the tool audit queue.
    pub audit_queue_capacity: usize,
    /// Sink for tool audit events; `None` disables correlation.
    pub audit_logger: Option<Arc<dyn AuditLogger>>,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("max_queued_requests", &self.max_queued_requests)
            .field("verbose", &self.verbose)
            .field("reconnect", &self.reconnect)
            .field("control_protocol", &self.control_protocol)
            .field("request_timeout", &self.request_timeout)
            .field("control_timeout", &self.control_timeout)
            .field("audit", &self.audit_logger.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_engine_config(&EngineConfig::default())
    }
}

impl SessionOptions {
    /// Options derived from engine configuration, without an audit logger.
    #[must_use]
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            max_queued_requests: config.session.max_queued_requests,
            verbose: config.session.verbose,
            reconnect: config.session.reconnect,
            control_protocol: config.session.control_protocol,
            request_timeout: config.timeouts.request_timeout(),
            control_timeout: config.timeouts.control_timeout(),
            audit_queue_capacity: config.audit.queue_capacity,
            audit_logger: None,
        }
    }

    /// Install a tool audit sink.
    #[must_use]
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = Some(logger);
        self
    }
}

/// Caller-facing handle of one engine session.
pub struct Session {
    commands: mpsc::Sender<Command>,
    transport: Arc<dyn Transport>,
    control: Arc<ControlChannel>,
    session_id: watch::Receiver<Option<String>>,
    audit_cancel: CancellationToken,
    /// Registry task followed by the audit dispatcher, if any.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.transport.state())
            .field("engine_session_id", &*self.session_id.borrow())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the engine described by `config` and connect a session to it.
    ///
    /// Installs a [`JsonlAuditWriter`] when `audit.enabled` is set and
    /// `audit.log_dir` names a directory.
    ///
    /// # Errors
    ///
    /// - [`AppError::Io`] if the audit directory cannot be created.
    /// - [`AppError::Startup`] if the engine cannot be launched.
    pub async fn spawn(config: &EngineConfig) -> Result<Self> {
        let mut options = SessionOptions::from_engine_config(config);
        if config.audit.enabled {
            match &config.audit.log_dir {
                Some(dir) => {
                    let writer = JsonlAuditWriter::new(dir.clone())?;
                    options = options.with_audit_logger(Arc::new(writer));
                }
                None => warn!("audit enabled without audit.log_dir, tool auditing disabled"),
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let transport = Arc::new(ProcessTransport::from_engine_config(config, events_tx));
        transport.start().await?;

        Ok(Self::connect(transport, events_rx, options))
    }

    /// Connect a session to `transport`, whose events arrive on `events`.
    ///
    /// The transport need not be started: with `reconnect` on, the first
    /// query starts it. Must be called inside a tokio runtime.
    #[must_use]
    pub fn connect(
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        options: SessionOptions,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (session_id_tx, session_id_rx) = watch::channel(None);
        let audit_cancel = CancellationToken::new();

        let control = Arc::new(ControlChannel::new(
            Arc::clone(&transport),
            options.control_protocol,
            options.control_timeout,
        ));

        let mut dispatcher = None;
        let correlator = match &options.audit_logger {
            Some(logger) => {
                let (audit_tx, audit_rx) = mpsc::channel(options.audit_queue_capacity.max(1));
                dispatcher = Some(spawn_audit_dispatcher(
                    Arc::clone(logger),
                    audit_rx,
                    audit_cancel.clone(),
                ));
                ToolUseCorrelator::new(Some(audit_tx))
            }
            None => ToolUseCorrelator::new(None),
        };

        let settings = RegistrySettings {
            max_queued: options.max_queued_requests,
            verbose: options.verbose,
            reconnect: options.reconnect,
            request_timeout: options.request_timeout,
            abandon_grace: options.control_timeout,
        };

        let registry = Registry::new(
            Arc::clone(&transport),
            Arc::clone(&control),
            correlator,
            settings,
            session_id_tx,
            commands_tx.downgrade(),
        );
        let mut tasks = vec![tokio::spawn(registry.run(commands_rx, events))];
        tasks.extend(dispatcher);

        info!(
            reconnect = options.reconnect,
            control = options.control_protocol,
            audit = options.audit_logger.is_some(),
            "session connected"
        );

        Self {
            commands: commands_tx,
            transport,
            control,
            session_id: session_id_rx,
            audit_cancel,
            tasks: Mutex::new(tasks),
        }
    }

    // ── Queries ──────────────────────────────────────────────

    /// Submit a query and return its identifier without waiting.
    ///
    /// # Errors
    ///
    /// - [`AppError::QueueFull`] if the admission queue is at capacity.
    /// - [`AppError::TransportNotReady`] if the transport is down and
    ///   reconnect is disabled.
    /// - [`AppError::Shutdown`] if the session is closed.
    pub async fn query(
        &self,
        payload: impl Into<QueryPayload>,
        mode: DeliveryMode,
    ) -> Result<RequestId> {
        let payload = payload.into();
        call(&self.commands, |reply| Command::Submit {
            payload,
            mode,
            reply,
        })
        .await?
    }

    /// Submit a query and wait for its terminal result.
    ///
    /// # Errors
    ///
    /// Submission errors, plus the request's own failure: transport errors,
    /// [`AppError::RequestTimeout`], or [`AppError::Interrupted`].
    pub async fn query_blocking(&self, payload: impl Into<QueryPayload>) -> Result<QueryOutcome> {
        let id = self.query(payload, DeliveryMode::Blocking).await?;
        self.wait(&id).await
    }

    /// Wait for the terminal result of a blocking request.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`] for unknown or streaming requests.
    /// - [`AppError::AlreadyConsumed`] if another caller is already waiting.
    /// - Otherwise the request's failure.
    pub async fn wait(&self, id: &RequestId) -> Result<QueryOutcome> {
        let id = id.clone();
        call(&self.commands, |reply| Command::Wait { id, reply }).await?
    }

    /// Pull the next message of a streaming request.
    ///
    /// Returns `Ok(None)` once the terminal result has been pulled and the
    /// buffer is empty.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for unknown or blocking requests, otherwise the
    /// request's failure (delivered once).
    pub async fn pull(&self, id: &RequestId) -> Result<Option<Message>> {
        pull(&self.commands, id).await
    }

    /// Submit a streaming query and return its message stream.
    ///
    /// # Errors
    ///
    /// Same as [`Session::query`].
    pub async fn stream(&self, payload: impl Into<QueryPayload>) -> Result<QueryStream> {
        let id = self.query(payload, DeliveryMode::Streaming).await?;
        Ok(QueryStream {
            id,
            commands: self.commands.clone(),
            finished: false,
        })
    }

    /// Cancel a request.
    ///
    /// An in-flight request is interrupted on the engine (best effort) and its
    /// caller receives [`AppError::Interrupted`]; a queued request is removed
    /// from the queue. Cancelling a completed request is a no-op.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] if the request is unknown.
    pub async fn cancel(&self, id: &RequestId) -> Result<()> {
        let id = id.clone();
        call(&self.commands, |reply| Command::Cancel { id, reply }).await?
    }

    /// Forget a request whose outcome is no longer wanted.
    pub async fn release(&self, id: &RequestId) {
        self.commands
            .send(Command::Release { id: id.clone() })
            .await
            .ok();
    }

    // ── Control and introspection ────────────────────────────

    /// The control-protocol channel.
    #[must_use]
    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    /// Receiver of engine-initiated control requests; `Some` only once.
    ///
    /// Answer each request with [`ControlChannel::respond`].
    #[must_use]
    pub fn control_requests(&self) -> Option<mpsc::Receiver<ControlRequestMessage>> {
        self.control.subscribe()
    }

    /// Session identifier announced by the engine.
    #[must_use]
    pub fn engine_session_id(&self) -> Option<String> {
        self.session_id.borrow().clone()
    }

    /// Registry snapshot.
    ///
    /// # Errors
    ///
    /// [`AppError::Shutdown`] if the session is closed.
    pub async fn stats(&self) -> Result<SessionStats> {
        call(&self.commands, |reply| Command::Stats { reply }).await
    }

    /// Transport health.
    #[must_use]
    pub fn health(&self) -> Health {
        self.transport.health()
    }

    /// Fail outstanding requests with [`AppError::Shutdown`], stop the engine,
    /// and flush queued audit events. Idempotent.
    ///
    /// # Errors
    ///
    /// [`AppError::Io`] if the registry task panicked.
    pub async fn close(&self) -> Result<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return Ok(());
        }

        if call(&self.commands, |reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            warn!("registry already stopped");
        }
        self.audit_cancel.cancel();
        for task in tasks {
            task.await
                .map_err(|err| AppError::Io(format!("session task failed: {err}")))?;
        }
        info!("session closed");
        Ok(())
    }
}

/// Messages of one streaming request.
///
/// Dropping the stream releases the request; an unfinished request is
/// interrupted.
#[derive(Debug)]
pub struct QueryStream {
    id: RequestId,
    commands: mpsc::Sender<Command>,
    finished: bool,
}

impl QueryStream {
    /// Identifier of the underlying request.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.id
    }

    /// Next message; `None` after the terminal result or an error.
    pub async fn next(&mut self) -> Option<Result<Message>> {
        if self.finished {
            return None;
        }
        match pull(&self.commands, &self.id).await {
            Ok(Some(message)) => {
                self.finished = message.is_terminal();
                Some(Ok(message))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Message>> + Send {
        futures_util::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        let release = Command::Release {
            id: self.id.clone(),
        };
        if self.commands.try_send(release).is_err() {
            let commands = self.commands.clone();
            let id = self.id.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    commands.send(Command::Release { id }).await.ok();
                });
            }
        }
    }
}

async fn pull(commands: &mpsc::Sender<Command>, id: &RequestId) -> Result<Option<Message>> {
    let id = id.clone();
    call(commands, |reply| Command::Pull { id, reply }).await?
}

/// Send a command built around a oneshot reply and await the answer.
async fn call<T>(
    commands: &mpsc::Sender<Command>,
    build: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(build(reply))
        .await
        .map_err(|_| AppError::Shutdown)?;
    rx.await.map_err(|_| AppError::Shutdown)
}
