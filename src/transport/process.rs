//! Subprocess transport adapter.
//!
//! [`ProcessTransport`] owns at most one engine process at a time. Each
//! successful [`start`](Transport::start) opens a new *generation*: a writer
//! task, an inbound pump, a stderr drain, and a supervisor that watches them.
//! Events from an older generation are ignored, so a late line from a dead
//! process can never be routed to a request on its replacement.
//!
//! # Disconnect sequence
//!
//! The supervisor reports a disconnect only after the inbound pump has
//! finished, so every line the engine wrote before exiting is delivered ahead
//! of the [`TransportEvent::Error`] that ends the in-flight request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::protocol::message::Message;
use crate::transport::reader::{run_reader, ReaderExit, ReaderStats};
use crate::transport::spawner::{
    describe_exit, drain_stderr, reap, spawn_engine, terminate, EngineProcess, SpawnConfig,
    StderrTail,
};
use crate::transport::writer::run_writer;
use crate::transport::{
    Health, InboundMessage, Transport, TransportEvent, TransportFuture, TransportState,
};
use crate::{AppError, Result};

/// Capacity of the outbound frame queue.
const WRITE_QUEUE_CAPACITY: usize = 64;

/// Capacity of the pump → supervisor message queue.
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Tunables of a [`ProcessTransport`].
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Largest accepted inbound line.
    pub max_line_bytes: usize,
    /// Grace period before a stopping engine is killed.
    pub stop_grace: Duration,
}

impl ProcessOptions {
    /// Options derived from engine configuration.
    #[must_use]
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            max_line_bytes: config.session.max_line_bytes,
            stop_grace: config.timeouts.stop_grace(),
        }
    }
}

/// Handles of the live connection.
struct Connection {
    frame_tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
    stopping: Arc<AtomicBool>,
    supervisor: JoinHandle<()>,
}

/// Mutable adapter state; never held across an `.await`.
struct LinkState {
    state: TransportState,
    generation: u64,
    connection: Option<Connection>,
    bound_request: Option<String>,
    last_error: Option<String>,
}

struct Shared {
    spawn: SpawnConfig,
    options: ProcessOptions,
    events: mpsc::Sender<TransportEvent>,
    link: Mutex<LinkState>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("transport: event receiver closed, dropping event");
        }
    }

    /// Forward one resolved message from generation `generation`.
    async fn forward(&self, generation: u64, message: Message) {
        {
            let mut link = self.link();
            if link.generation != generation || link.state == TransportState::Disconnected {
                debug!(generation, "transport: dropping message from stale connection");
                return;
            }
            if message.is_terminal() {
                link.bound_request = None;
            }
        }

        let event = match message {
            Message::ControlRequest(request) => TransportEvent::ControlRequestReceived(request),
            message => TransportEvent::MessageReceived(InboundMessage {
                generation,
                message,
            }),
        };
        self.emit(event).await;
    }

    /// Move generation `generation` to `Disconnected` and report `error`.
    ///
    /// A no-op when the generation is stale or already disconnected.
    async fn disconnect(&self, generation: u64, error: AppError, stats: &ReaderStats) {
        let in_flight = {
            let mut link = self.link();
            if link.generation != generation || link.state == TransportState::Disconnected {
                return;
            }
            link.state = TransportState::Disconnected;
            link.connection = None;
            link.last_error = Some(error.to_string());
            link.bound_request.take()
        };

        warn!(
            generation,
            error = %error,
            ?in_flight,
            forwarded = stats.forwarded,
            skipped = stats.skipped,
            "transport disconnected"
        );
        self.emit(TransportEvent::Error {
            generation,
            error,
            in_flight,
        })
        .await;
        self.emit(TransportEvent::StatusChanged {
            generation,
            state: TransportState::Disconnected,
        })
        .await;
    }
}

/// Transport adapter over an engine subprocess.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ProcessTransport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = self.shared.link();
        f.debug_struct("ProcessTransport")
            .field("executable", &self.shared.spawn.executable)
            .field("state", &link.state)
            .field("generation", &link.generation)
            .finish_non_exhaustive()
    }
}

impl ProcessTransport {
    /// Build a transport reporting to `events`. Nothing is spawned until
    /// [`Transport::start`].
    #[must_use]
    pub fn new(
        spawn: SpawnConfig,
        options: ProcessOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                spawn,
                options,
                events,
                link: Mutex::new(LinkState {
                    state: TransportState::Disconnected,
                    generation: 0,
                    connection: None,
                    bound_request: None,
                    last_error: None,
                }),
            }),
        }
    }

    /// Build a transport from engine configuration.
    #[must_use]
    pub fn from_engine_config(config: &EngineConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        Self::new(
            SpawnConfig::from_engine_config(config),
            ProcessOptions::from_engine_config(config),
            events,
        )
    }

    /// Request currently bound to outbound writes.
    #[must_use]
    pub fn bound_request(&self) -> Option<String> {
        self.shared.link().bound_request.clone()
    }

    async fn start_inner(&self) -> Result<()> {
        let generation = {
            let mut link = self.shared.link();
            match link.state {
                TransportState::Ready | TransportState::Provisioning => return Ok(()),
                TransportState::Disconnected => {}
            }
            link.generation += 1;
            link.state = TransportState::Provisioning;
            link.bound_request = None;
            link.generation
        };

        info!(generation, "transport provisioning");
        self.shared
            .emit(TransportEvent::StatusChanged {
                generation,
                state: TransportState::Provisioning,
            })
            .await;

        let process = match spawn_engine(&self.shared.spawn) {
            Ok(process) => process,
            Err(err) => {
                {
                    let mut link = self.shared.link();
                    link.state = TransportState::Disconnected;
                    link.last_error = Some(err.to_string());
                }
                warn!(generation, error = %err, "transport startup failed");
                self.shared
                    .emit(TransportEvent::Error {
                        generation,
                        error: err.clone(),
                        in_flight: None,
                    })
                    .await;
                self.shared
                    .emit(TransportEvent::StatusChanged {
                        generation,
                        state: TransportState::Disconnected,
                    })
                    .await;
                return Err(err);
            }
        };

        let connection = launch(Arc::clone(&self.shared), generation, process);

        let superseded = {
            let mut link = self.shared.link();
            if link.generation == generation && link.state == TransportState::Provisioning {
                link.state = TransportState::Ready;
                link.last_error = None;
                link.connection = Some(connection);
                None
            } else {
                Some(connection)
            }
        };

        if let Some(connection) = superseded {
            // A stop raced the launch; tear the new process down again.
            info!(generation, "transport stopped during startup, terminating engine");
            connection.stopping.store(true, Ordering::SeqCst);
            connection.cancel.cancel();
            drop(connection.frame_tx);
            connection.supervisor.await.ok();
            self.shared
                .emit(TransportEvent::StatusChanged {
                    generation,
                    state: TransportState::Disconnected,
                })
                .await;
            return Err(AppError::Startup("transport stopped during startup".into()));
        }

        info!(generation, "transport ready");
        self.shared
            .emit(TransportEvent::StatusChanged {
                generation,
                state: TransportState::Ready,
            })
            .await;
        Ok(())
    }

    async fn write(&self, request_id: Option<&str>, frame: Value) -> Result<()> {
        let frame_tx = {
            let mut link = self.shared.link();
            let Some(connection) = link
                .connection
                .as_ref()
                .filter(|_| link.state == TransportState::Ready)
            else {
                return Err(AppError::TransportNotReady(format!(
                    "transport is {}",
                    link.state
                )));
            };
            let frame_tx = connection.frame_tx.clone();

            if let Some(request_id) = request_id {
                if let Some(previous) = link.bound_request.as_deref() {
                    if previous != request_id {
                        warn!(previous, request_id, "transport: rebinding outbound writes");
                    }
                }
                link.bound_request = Some(request_id.to_owned());
            }
            frame_tx
        };

        frame_tx
            .send(frame)
            .await
            .map_err(|_| AppError::ChannelClosed("engine write queue closed".into()))
    }

    async fn stop_inner(&self) -> Result<()> {
        let connection = {
            let mut link = self.shared.link();
            if link.state == TransportState::Provisioning {
                // The pending launch sees the state change and tears its
                // process down before reporting.
                info!(generation = link.generation, "transport stopping during startup");
                link.state = TransportState::Disconnected;
                link.last_error = Some("transport stopped during startup".into());
                link.bound_request = None;
            }
            link.connection.take()
        };

        let Some(connection) = connection else {
            debug!("transport: no live connection to stop");
            return Ok(());
        };

        info!("transport stopping");
        connection.stopping.store(true, Ordering::SeqCst);
        connection.cancel.cancel();
        drop(connection.frame_tx);
        connection
            .supervisor
            .await
            .map_err(|err| AppError::Io(format!("transport supervisor failed: {err}")))
    }
}

impl Transport for ProcessTransport {
    fn start(&self) -> TransportFuture<'_, ()> {
        Box::pin(self.start_inner())
    }

    fn submit(&self, request_id: &str, frame: Value) -> TransportFuture<'_, ()> {
        let request_id = request_id.to_owned();
        Box::pin(async move { self.write(Some(&request_id), frame).await })
    }

    fn send_control(&self, frame: Value) -> TransportFuture<'_, ()> {
        Box::pin(self.write(None, frame))
    }

    fn stop(&self) -> TransportFuture<'_, ()> {
        Box::pin(self.stop_inner())
    }

    fn state(&self) -> TransportState {
        self.shared.link().state
    }

    fn generation(&self) -> u64 {
        self.shared.link().generation
    }

    fn health(&self) -> Health {
        let link = self.shared.link();
        match link.state {
            TransportState::Ready => Health::Healthy,
            TransportState::Provisioning => Health::Degraded("engine is starting".into()),
            TransportState::Disconnected => Health::Unhealthy(
                link.last_error
                    .clone()
                    .unwrap_or_else(|| "engine not started".into()),
            ),
        }
    }
}

/// Start the writer, pump, stderr drain, and supervisor for one generation.
fn launch(shared: Arc<Shared>, generation: u64, process: EngineProcess) -> Connection {
    let EngineProcess {
        child,
        stdin,
        stdout,
        stderr,
    } = process;

    let cancel = CancellationToken::new();
    let stopping = Arc::new(AtomicBool::new(false));
    let (frame_tx, frame_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);

    let writer = tokio::spawn(run_writer(stdin, frame_rx, cancel.clone()));

    let tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
    let stderr_drain = tokio::spawn(drain_stderr(stderr, Arc::clone(&tail)));

    let (message_tx, message_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let reader = tokio::spawn(run_reader(
        stdout,
        shared.options.max_line_bytes,
        message_tx,
        cancel.clone(),
    ));

    let supervisor = tokio::spawn(supervise(Supervised {
        shared,
        generation,
        child,
        writer,
        reader,
        message_rx,
        tail,
        stderr_drain,
        cancel: cancel.clone(),
        stopping: Arc::clone(&stopping),
    }));

    Connection {
        frame_tx,
        cancel,
        stopping,
        supervisor,
    }
}

struct Supervised {
    shared: Arc<Shared>,
    generation: u64,
    child: tokio::process::Child,
    writer: JoinHandle<Result<()>>,
    reader: JoinHandle<(ReaderExit, ReaderStats)>,
    message_rx: mpsc::Receiver<Message>,
    tail: StderrTail,
    stderr_drain: JoinHandle<()>,
    cancel: CancellationToken,
    stopping: Arc<AtomicBool>,
}

/// How long to wait for the stderr drain to catch up after the engine exits.
const STDERR_SETTLE: Duration = Duration::from_millis(200);

/// Relay inbound messages until the pump stops, then classify the disconnect.
async fn supervise(mut s: Supervised) {
    let mut write_failure: Option<AppError> = None;
    let mut writer_done = false;

    loop {
        tokio::select! {
            message = s.message_rx.recv() => match message {
                Some(message) => s.shared.forward(s.generation, message).await,
                None => break,
            },
            joined = &mut s.writer, if !writer_done => {
                writer_done = true;
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        write_failure = Some(err);
                        s.cancel.cancel();
                    }
                    Err(err) => {
                        write_failure = Some(AppError::ChannelClosed(format!("writer task failed: {err}")));
                        s.cancel.cancel();
                    }
                }
            }
        }
    }

    let (exit, stats) = match s.reader.await {
        Ok(joined) => joined,
        Err(err) => (
            ReaderExit::Io(format!("reader task failed: {err}")),
            ReaderStats::default(),
        ),
    };
    debug!(
        generation = s.generation,
        ?exit,
        forwarded = stats.forwarded,
        skipped = stats.skipped,
        "transport: inbound pump finished"
    );

    // Stops the writer (closing stdin) if it is still running.
    s.cancel.cancel();
    let grace = s.shared.options.stop_grace;

    let error = if s.stopping.load(Ordering::SeqCst) {
        terminate(&mut s.child, grace).await;
        AppError::ChannelClosed("transport stopped".into())
    } else if let Some(failure) = write_failure {
        terminate(&mut s.child, grace).await;
        failure
    } else if let ReaderExit::Io(reason) = exit {
        terminate(&mut s.child, grace).await;
        AppError::ChannelClosed(format!("read failed: {reason}"))
    } else {
        match reap(&mut s.child, grace).await {
            Some(status) => {
                let (code, mut reason) = describe_exit(status);
                tokio::time::timeout(STDERR_SETTLE, &mut s.stderr_drain)
                    .await
                    .ok();
                let last_line = s
                    .tail
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .back()
                    .cloned();
                if let Some(last_line) = last_line {
                    reason.push_str(": ");
                    reason.push_str(&last_line);
                }
                AppError::ProcessExited { code, reason }
            }
            None => AppError::ProcessExited {
                code: None,
                reason: "exit status unavailable".into(),
            },
        }
    };

    s.shared.disconnect(s.generation, error, &stats).await;
}
