//! Request model.
//!
//! A [`Request`] is one logical query. It is created by the registry on
//! submission and mutated only inside the registry task.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::message::{Message, ResultMessage};
use crate::protocol::outbound::QueryPayload;
use crate::{AppError, Result};

/// Locally generated request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("req_{}", Uuid::new_v4().simple()))
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// How messages reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// One reply when the terminal result arrives.
    Blocking,
    /// Every message, pulled one at a time.
    Streaming,
}

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Queued or in flight.
    Active,
    /// Terminal result, error, or cancellation recorded.
    Completed,
}

/// Reply to a blocking query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// Identifier of the request.
    pub request_id: RequestId,
    /// The terminal result.
    pub result: ResultMessage,
    /// Intermediate messages, kept only when the session is verbose.
    pub messages: Vec<Message>,
}

impl QueryOutcome {
    /// Final text reported by the engine.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.result.text.as_deref()
    }

    /// Whether the engine reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

pub(crate) type OutcomeSender = oneshot::Sender<Result<QueryOutcome>>;
pub(crate) type PullSender = oneshot::Sender<Result<Option<Message>>>;

/// One logical query tracked by the registry.
#[derive(Debug)]
pub(crate) struct Request {
    pub id: RequestId,
    pub mode: DeliveryMode,
    pub status: RequestStatus,
    /// Payload held until the request is admitted.
    pub payload: Option<QueryPayload>,
    /// Streaming: messages not yet pulled. Blocking: kept messages (verbose).
    pub buffer: VecDeque<Message>,
    pub waiter: Option<OutcomeSender>,
    pub pull_waiters: VecDeque<PullSender>,
    /// Blocking: outcome recorded before anyone waited.
    pub outcome: Option<Result<QueryOutcome>>,
    /// Streaming: terminal error not yet pulled.
    pub error: Option<AppError>,
    pub created_at: Instant,
    pub deadline: Option<Instant>,
    /// The caller released the handle; nothing is delivered any more.
    pub detached: bool,
    /// Streaming: completion or the terminal error reached a puller.
    pub exhausted: bool,
}

impl Request {
    pub fn new(
        id: RequestId,
        mode: DeliveryMode,
        payload: QueryPayload,
        timeout: Option<std::time::Duration>,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            id,
            mode,
            status: RequestStatus::Active,
            payload: Some(payload),
            buffer: VecDeque::new(),
            waiter: None,
            pull_waiters: VecDeque::new(),
            outcome: None,
            error: None,
            created_at,
            deadline: timeout.map(|t| created_at + t),
            detached: false,
            exhausted: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RequestStatus::Active
    }

    /// Route a non-terminal message.
    pub fn deliver(&mut self, message: Message, keep_intermediate: bool) {
        if self.detached || !self.is_active() {
            return;
        }
        match self.mode {
            DeliveryMode::Blocking => {
                if keep_intermediate {
                    self.buffer.push_back(message);
                }
            }
            DeliveryMode::Streaming => self.hand_over(message),
        }
    }

    /// Record the terminal result and complete the request.
    pub fn complete(&mut self, result: ResultMessage) {
        if !self.is_active() {
            return;
        }
        self.status = RequestStatus::Completed;
        self.deadline = None;
        if self.detached {
            return;
        }
        match self.mode {
            DeliveryMode::Blocking => {
                let outcome = QueryOutcome {
                    request_id: self.id.clone(),
                    result,
                    messages: self.buffer.drain(..).collect(),
                };
                self.settle(Ok(outcome));
            }
            DeliveryMode::Streaming => {
                self.hand_over(Message::Result(result));
                // Remaining pullers learn the stream ended.
                if self.buffer.is_empty() && !self.pull_waiters.is_empty() {
                    self.exhausted = true;
                    for waiter in self.pull_waiters.drain(..) {
                        waiter.send(Ok(None)).ok();
                    }
                }
            }
        }
    }

    /// Complete the request with an error, delivered exactly once.
    pub fn fail(&mut self, error: AppError) {
        if !self.is_active() {
            return;
        }
        debug!(request_id = %self.id, error = %error, "request failed");
        self.status = RequestStatus::Completed;
        self.deadline = None;
        self.payload = None;
        if self.detached {
            return;
        }
        match self.mode {
            DeliveryMode::Blocking => {
                self.buffer.clear();
                self.settle(Err(error));
            }
            DeliveryMode::Streaming => {
                self.buffer.clear();
                let mut pending = Some(error);
                while let Some(error) = pending.take() {
                    let Some(waiter) = self.pull_waiters.pop_front() else {
                        pending = Some(error);
                        break;
                    };
                    match waiter.send(Err(error)) {
                        Ok(()) => self.exhausted = true,
                        Err(Err(error)) => pending = Some(error),
                        Err(Ok(_)) => {}
                    }
                }
                if self.exhausted {
                    for waiter in self.pull_waiters.drain(..) {
                        waiter.send(Ok(None)).ok();
                    }
                } else {
                    self.error = pending;
                }
            }
        }
    }

    /// Register the blocking waiter; answers at once when already settled.
    pub fn wait(&mut self, reply: OutcomeSender) {
        if let Some(outcome) = self.outcome.take() {
            reply.send(outcome).ok();
        } else if self.waiter.is_some() {
            reply
                .send(Err(AppError::AlreadyConsumed(format!(
                    "request {} already has a waiter",
                    self.id
                ))))
                .ok();
        } else {
            self.waiter = Some(reply);
        }
    }

    /// Serve one pull, or park the puller until something arrives.
    pub fn pull(&mut self, reply: PullSender) {
        if let Some(message) = self.buffer.pop_front() {
            reply.send(Ok(Some(message))).ok();
        } else if let Some(error) = self.error.take() {
            self.exhausted = true;
            reply.send(Err(error)).ok();
        } else if self.is_active() {
            self.pull_waiters.push_back(reply);
        } else {
            self.exhausted = true;
            reply.send(Ok(None)).ok();
        }
    }

    /// Whether the registry can forget this request.
    ///
    /// Completed requests are retired once their outcome has reached the
    /// caller, or once the caller let go of the handle.
    pub fn is_retired(&self) -> bool {
        if self.is_active() {
            return false;
        }
        if self.detached {
            return true;
        }
        match self.mode {
            DeliveryMode::Blocking => self.outcome.is_none() && self.waiter.is_none(),
            DeliveryMode::Streaming => self.exhausted,
        }
    }

    fn hand_over(&mut self, message: Message) {
        let mut item = Ok(Some(message));
        while let Some(waiter) = self.pull_waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => return,
                Err(returned) => item = returned,
            }
        }
        if let Ok(Some(message)) = item {
            self.buffer.push_back(message);
        }
    }

    fn settle(&mut self, outcome: Result<QueryOutcome>) {
        match self.waiter.take() {
            Some(waiter) => {
                if waiter.send(outcome).is_err() {
                    debug!(request_id = %self.id, "blocking waiter went away");
                }
            }
            None => self.outcome = Some(outcome),
        }
    }
}
