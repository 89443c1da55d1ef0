//! Request registry.
//!
//! A single task owns every [`Request`], the admission queue, and the
//! [`ToolUseCorrelator`]. Callers reach it through [`Command`]s; the transport
//! reaches it through [`TransportEvent`]s. Because only this task mutates
//! registry state, routing decisions need no locks.
//!
//! # Admission
//!
//! The engine handles one user turn at a time, so at most one request is in
//! flight. Later submissions wait in a bounded FIFO queue and are written
//! only after the in-flight request receives its terminal result.
//!
//! A request that is cancelled or times out while in flight leaves its slot
//! *abandoned*: nothing more is delivered to the caller, but the slot stays
//! occupied until the engine's own result arrives (or a grace period
//! expires), so the next query never sees the tail of the previous turn.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::audit::ToolUseCorrelator;
use crate::protocol::message::{Message, ResultMessage};
use crate::protocol::outbound::{encode_user, QueryPayload, DEFAULT_SESSION_ID};
use crate::session::control::ControlChannel;
use crate::session::request::{
    DeliveryMode, OutcomeSender, PullSender, Request, RequestId,
};
use crate::transport::{InboundMessage, Transport, TransportEvent, TransportState};
use crate::{AppError, Result};

/// Snapshot of registry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Requests not yet completed (queued and in flight).
    pub active: usize,
    /// Requests waiting for admission.
    pub queued: usize,
    /// Request currently bound to the transport.
    pub in_flight: Option<RequestId>,
    /// Tool invocations awaiting a result.
    pub pending_tool_invocations: usize,
    /// Audit events handed to the dispatcher.
    pub audit_events_emitted: u64,
    /// Audit events lost to a full queue.
    pub audit_events_dropped: u64,
    /// Transport lifecycle state.
    pub transport_state: TransportState,
    /// Latest connection generation seen.
    pub generation: u64,
}

/// Messages from [`Session`](crate::session::Session) handles to the registry.
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        payload: QueryPayload,
        mode: DeliveryMode,
        reply: oneshot::Sender<Result<RequestId>>,
    },
    Wait {
        id: RequestId,
        reply: OutcomeSender,
    },
    Pull {
        id: RequestId,
        reply: PullSender,
    },
    Cancel {
        id: RequestId,
        reply: oneshot::Sender<Result<()>>,
    },
    Release {
        id: RequestId,
    },
    StartFailed {
        error: AppError,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Registry tunables.
#[derive(Debug, Clone)]
pub(crate) struct RegistrySettings {
    pub max_queued: usize,
    pub verbose: bool,
    pub reconnect: bool,
    pub request_timeout: Option<Duration>,
    /// How long an abandoned slot waits for the engine's result.
    pub abandon_grace: Duration,
}

#[derive(Debug)]
struct InFlight {
    id: RequestId,
    generation: u64,
    abandoned_at: Option<Instant>,
}

pub(crate) struct Registry {
    transport: Arc<dyn Transport>,
    control: Arc<ControlChannel>,
    correlator: ToolUseCorrelator,
    settings: RegistrySettings,
    requests: HashMap<RequestId, Request>,
    queue: VecDeque<RequestId>,
    in_flight: Option<InFlight>,
    generation: u64,
    starting: bool,
    session_id: watch::Sender<Option<String>>,
    commands: mpsc::WeakSender<Command>,
}

impl Registry {
    pub fn new(
        transport: Arc<dyn Transport>,
        control: Arc<ControlChannel>,
        correlator: ToolUseCorrelator,
        settings: RegistrySettings,
        session_id: watch::Sender<Option<String>>,
        commands: mpsc::WeakSender<Command>,
    ) -> Self {
        let generation = transport.generation();
        Self {
            transport,
            control,
            correlator,
            settings,
            requests: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: None,
            generation,
            starting: false,
            session_id,
            commands,
        }
    }

    /// Run until shutdown or until every session handle is dropped.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let mut events_open = true;

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        reply.send(()).ok();
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("registry: every session handle dropped");
                        self.shutdown().await;
                        break;
                    }
                },

                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        events_open = false;
                        warn!("registry: transport event stream ended");
                        self.fail_all(&AppError::ChannelClosed("transport event stream ended".into()));
                    }
                },

                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }

            self.admit().await;
            self.retire();
        }

        info!("registry stopped");
    }

    // ── Commands ─────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                payload,
                mode,
                reply,
            } => {
                reply.send(self.submit(payload, mode)).ok();
            }
            Command::Wait { id, reply } => match self.requests.get_mut(&id) {
                Some(request) if request.mode == DeliveryMode::Blocking => request.wait(reply),
                _ => {
                    reply.send(Err(AppError::NotFound(format!("blocking request {id}")))).ok();
                }
            },
            Command::Pull { id, reply } => match self.requests.get_mut(&id) {
                Some(request) if request.mode == DeliveryMode::Streaming => request.pull(reply),
                _ => {
                    reply.send(Err(AppError::NotFound(format!("streaming request {id}")))).ok();
                }
            },
            Command::Cancel { id, reply } => {
                reply.send(self.cancel(&id)).ok();
            }
            Command::Release { id } => self.release(&id),
            Command::StartFailed { error } => {
                self.starting = false;
                if self.transport.state() == TransportState::Disconnected {
                    self.fail_all(&error);
                }
            }
            Command::Stats { reply } => {
                reply.send(self.stats()).ok();
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn submit(&mut self, payload: QueryPayload, mode: DeliveryMode) -> Result<RequestId> {
        if self.queue.len() >= self.settings.max_queued {
            return Err(AppError::QueueFull(self.settings.max_queued));
        }

        let state = self.transport.state();
        if state == TransportState::Disconnected && !self.settings.reconnect {
            return Err(AppError::TransportNotReady(
                "transport disconnected and reconnect is disabled".into(),
            ));
        }

        let id = RequestId::generate();
        let request = Request::new(id.clone(), mode, payload, self.settings.request_timeout);
        self.requests.insert(id.clone(), request);
        self.queue.push_back(id.clone());
        debug!(request_id = %id, ?mode, queued = self.queue.len(), "request submitted");

        if state == TransportState::Disconnected {
            self.ensure_started();
        }
        Ok(id)
    }

    fn cancel(&mut self, id: &RequestId) -> Result<()> {
        let Some(request) = self.requests.get_mut(id) else {
            return Err(AppError::NotFound(format!("request {id}")));
        };
        if !request.is_active() {
            return Ok(());
        }

        info!(request_id = %id, "cancelling request");
        request.fail(AppError::Interrupted(format!("request {id} cancelled")));
        self.withdraw(id);
        Ok(())
    }

    fn release(&mut self, id: &RequestId) {
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };
        request.detached = true;
        if request.is_active() {
            debug!(request_id = %id, "releasing unfinished request");
            request.fail(AppError::Interrupted(format!("request {id} released")));
            self.withdraw(id);
        }
    }

    /// Take a failed request out of the queue, or abandon its slot.
    fn withdraw(&mut self, id: &RequestId) {
        if let Some(position) = self.queue.iter().position(|queued| queued == id) {
            self.queue.remove(position);
            return;
        }
        if self.in_flight.as_ref().is_some_and(|f| &f.id == id) {
            self.abandon_in_flight();
        }
    }

    fn abandon_in_flight(&mut self) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        if in_flight.abandoned_at.is_some() {
            return;
        }
        in_flight.abandoned_at = Some(Instant::now());
        self.correlator.release(in_flight.id.as_str());

        let request_id = in_flight.id.clone();
        let control = Arc::clone(&self.control);
        tokio::spawn(async move {
            match control.interrupt().await {
                Ok(_) => debug!(%request_id, "engine acknowledged interrupt"),
                Err(AppError::ControlNotSupported(reason)) => {
                    debug!(%request_id, %reason, "interrupt unavailable, waiting for result");
                }
                Err(err) => warn!(%request_id, error = %err, "interrupt failed"),
            }
        });
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            active: self.requests.values().filter(|r| r.is_active()).count(),
            queued: self.queue.len(),
            in_flight: self.in_flight.as_ref().map(|f| f.id.clone()),
            pending_tool_invocations: self.correlator.pending(),
            audit_events_emitted: self.correlator.emitted(),
            audit_events_dropped: self.correlator.dropped(),
            transport_state: self.transport.state(),
            generation: self.generation,
        }
    }

    // ── Transport events ─────────────────────────────────────

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived(inbound) => self.route(inbound),
            TransportEvent::ControlRequestReceived(request) => {
                let control = Arc::clone(&self.control);
                tokio::spawn(async move { control.dispatch_inbound(request).await });
            }
            TransportEvent::Error {
                generation,
                error,
                in_flight,
            } => self.on_transport_error(generation, &error, in_flight.as_deref()),
            TransportEvent::StatusChanged { generation, state } => {
                debug!(generation, %state, "registry: transport status changed");
                self.generation = self.generation.max(generation);
                if state != TransportState::Provisioning {
                    self.starting = false;
                }
            }
        }
    }

    fn route(&mut self, inbound: InboundMessage) {
        let InboundMessage {
            generation,
            message,
        } = inbound;

        self.track_session_id(&message);

        match message {
            Message::ControlResponse(response) => {
                self.control.resolve(response);
            }
            Message::ControlRequest(request) => {
                let control = Arc::clone(&self.control);
                tokio::spawn(async move { control.dispatch_inbound(request).await });
            }
            Message::Result(result) => self.finish_in_flight(generation, result),
            message => {
                let Some(in_flight) = self.in_flight.as_ref() else {
                    debug!(kind = message.kind(), "registry: no request in flight, dropping message");
                    return;
                };
                if in_flight.generation != generation || in_flight.abandoned_at.is_some() {
                    debug!(kind = message.kind(), request_id = %in_flight.id, "registry: dropping message for abandoned slot");
                    return;
                }
                self.correlator.observe(in_flight.id.as_str(), &message);
                if let Some(request) = self.requests.get_mut(&in_flight.id) {
                    request.deliver(message, self.settings.verbose);
                }
            }
        }
    }

    fn finish_in_flight(&mut self, generation: u64, result: ResultMessage) {
        let Some(in_flight) = self.in_flight.take_if(|f| f.generation == generation) else {
            warn!(generation, "registry: result without a request in flight");
            return;
        };

        self.correlator.release(in_flight.id.as_str());
        if in_flight.abandoned_at.is_some() {
            debug!(request_id = %in_flight.id, "registry: abandoned slot released by result");
            return;
        }

        if let Some(request) = self.requests.get_mut(&in_flight.id) {
            info!(
                request_id = %in_flight.id,
                success = result.is_success(),
                elapsed_ms = u64::try_from(request.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "request completed"
            );
            request.complete(result);
        }
    }

    fn on_transport_error(&mut self, generation: u64, error: &AppError, bound: Option<&str>) {
        warn!(generation, error = %error, bound_request = ?bound, "registry: transport failure");
        self.control.fail_all(error);

        if let Some(in_flight) = self.in_flight.take_if(|f| f.generation <= generation) {
            self.correlator.release(in_flight.id.as_str());
            if let Some(request) = self.requests.get_mut(&in_flight.id) {
                request.fail(error.clone());
            }
        }

        // Queued requests belong to no connection yet; a failure reported by
        // an older generation leaves them for the replacement.
        if generation >= self.generation {
            for id in self.queue.drain(..) {
                if let Some(request) = self.requests.get_mut(&id) {
                    request.fail(error.clone());
                }
            }
        }
    }

    fn track_session_id(&self, message: &Message) {
        let announced = match message {
            Message::Init(init) => Some(init.session_id.as_str()),
            Message::Result(result) => Some(result.session_id.as_str()),
            _ => None,
        };
        if let Some(announced) = announced {
            self.session_id.send_if_modified(|current| {
                if current.as_deref() == Some(announced) {
                    return false;
                }
                info!(session_id = announced, "engine session id updated");
                *current = Some(announced.to_owned());
                true
            });
        }
    }

    // ── Admission ────────────────────────────────────────────

    async fn admit(&mut self) {
        while self.in_flight.is_none() && self.transport.state() == TransportState::Ready {
            let Some(id) = self.queue.pop_front() else {
                return;
            };
            let Some(payload) = self
                .requests
                .get_mut(&id)
                .filter(|r| r.is_active())
                .and_then(|r| r.payload.take())
            else {
                continue;
            };

            let session_id = self
                .session_id
                .borrow()
                .clone()
                .unwrap_or_else(|| DEFAULT_SESSION_ID.to_owned());

            let submitted = match encode_user(&payload, &session_id) {
                Ok(frame) => self.transport.submit(id.as_str(), frame).await,
                Err(err) => Err(err),
            };

            match submitted {
                Ok(()) => {
                    let generation = self.transport.generation();
                    info!(request_id = %id, generation, %session_id, "request admitted");
                    self.in_flight = Some(InFlight {
                        id,
                        generation,
                        abandoned_at: None,
                    });
                }
                Err(AppError::TransportNotReady(reason)) => {
                    debug!(request_id = %id, %reason, "transport not ready, requeueing");
                    if let Some(request) = self.requests.get_mut(&id) {
                        request.payload = Some(payload);
                    }
                    self.queue.push_front(id);
                    return;
                }
                Err(err) => {
                    warn!(request_id = %id, error = %err, "request submission failed");
                    if let Some(request) = self.requests.get_mut(&id) {
                        request.fail(err);
                    }
                }
            }
        }

        if self.transport.state() == TransportState::Disconnected
            && !self.queue.is_empty()
            && self.settings.reconnect
        {
            self.ensure_started();
        }
    }

    fn ensure_started(&mut self) {
        if self.starting || !self.settings.reconnect {
            return;
        }
        self.starting = true;

        info!("registry: starting transport");
        let transport = Arc::clone(&self.transport);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            if let Err(error) = transport.start().await {
                if let Some(commands) = commands.upgrade() {
                    commands.send(Command::StartFailed { error }).await.ok();
                }
            }
        });
    }

    // ── Timeouts and cleanup ─────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        let requests = self
            .requests
            .values()
            .filter(|r| r.is_active())
            .filter_map(|r| r.deadline);
        let abandoned = self
            .in_flight
            .as_ref()
            .and_then(|f| f.abandoned_at)
            .map(|at| at + self.settings.abandon_grace);
        requests.chain(abandoned).min()
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| r.is_active() && r.deadline.is_some_and(|d| d <= now))
            .map(|r| r.id.clone())
            .collect();

        for id in expired {
            if let Some(request) = self.requests.get_mut(&id) {
                let waited = now.duration_since(request.created_at);
                warn!(request_id = %id, waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX), "request timed out");
                request.fail(AppError::RequestTimeout(format!(
                    "request {id} got no result within {}s",
                    waited.as_secs()
                )));
            }
            self.withdraw(&id);
        }

        let stale = self
            .in_flight
            .as_ref()
            .and_then(|f| f.abandoned_at)
            .is_some_and(|at| at + self.settings.abandon_grace <= now);
        if let Some(in_flight) = self.in_flight.take_if(|_| stale) {
            warn!(request_id = %in_flight.id, "abandoned slot never saw a result, releasing it");
        }
    }

    fn retire(&mut self) {
        let correlator = &mut self.correlator;
        self.requests.retain(|id, request| {
            if !request.is_retired() {
                return true;
            }
            correlator.release(id.as_str());
            debug!(request_id = %id, "request retired");
            false
        });
    }

    fn fail_all(&mut self, error: &AppError) {
        self.control.fail_all(error);
        self.queue.clear();
        if let Some(in_flight) = self.in_flight.take() {
            self.correlator.release(in_flight.id.as_str());
        }
        for request in self.requests.values_mut() {
            request.fail(error.clone());
        }
    }

    async fn shutdown(&mut self) {
        info!(active = self.requests.len(), "registry shutting down");
        self.fail_all(&AppError::Shutdown);
        if let Err(err) = self.transport.stop().await {
            warn!(error = %err, "transport stop failed");
        }
    }
}
