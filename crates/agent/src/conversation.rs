//! Per-connection conversation sessions.
//!
//! Each session runs as its own task draining one event channel. User
//! messages, human resolutions, snapshots and close requests all arrive on
//! that channel, so turns stay sequential and a close drops the in-flight
//! turn future. A session awaiting a human also rechecks its request in
//! storage, which is how resolutions made by the CLI reach it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use concierge_core::domain::handoff::HandoffRequestId;
use concierge_core::domain::session::{Role, Session, SessionId, SessionState};
use concierge_core::domain::tenant::TenantId;
use concierge_core::errors::ApplicationError;

use crate::context::AgentContext;
use crate::knowledge::KnowledgeBase;
use crate::runtime::TurnOutcome;

const BLANK_MESSAGE: &str = "Message text must not be blank.";
const HANDOFF_UNAVAILABLE: &str =
    "We couldn't reach a human agent right now. Please try again shortly.";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Answer { text: String },
    Handoff { query: String },
    Error { message: String },
}

#[derive(Debug)]
pub enum SessionEvent {
    UserMessage(String),
    HumanResolved { request_id: HandoffRequestId, text: String },
    Snapshot(oneshot::Sender<Session>),
    Close,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session `{0}` is closed")]
    Closed(SessionId),
}

/// Live sessions by id, used to route human resolutions back to their owner.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    senders: Arc<RwLock<HashMap<SessionId, mpsc::Sender<SessionEvent>>>>,
}

impl SessionRegistry {
    pub async fn register(&self, session_id: SessionId, sender: mpsc::Sender<SessionEvent>) {
        self.senders.write().await.insert(session_id, sender);
    }

    pub async fn unregister(&self, session_id: &SessionId) {
        self.senders.write().await.remove(session_id);
    }

    pub async fn is_live(&self, session_id: &SessionId) -> bool {
        self.senders.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.senders.read().await.len()
    }

    /// Returns `false` when the session is gone or its channel is closed.
    pub async fn notify(&self, session_id: &SessionId, event: SessionEvent) -> bool {
        let sender = self.senders.read().await.get(session_id).cloned();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }
}

pub struct SessionHandle {
    session_id: SessionId,
    tenant_id: TenantId,
    events: mpsc::Sender<SessionEvent>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub async fn send_user_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.events
            .send(SessionEvent::UserMessage(text.into()))
            .await
            .map_err(|_| SessionError::Closed(self.session_id.clone()))
    }

    pub async fn snapshot(&self) -> Result<Session, SessionError> {
        let (reply, receive) = oneshot::channel();
        self.events
            .send(SessionEvent::Snapshot(reply))
            .await
            .map_err(|_| SessionError::Closed(self.session_id.clone()))?;
        receive.await.map_err(|_| SessionError::Closed(self.session_id.clone()))
    }

    /// Cancels any in-flight turn and waits for the session task to finish.
    pub async fn close(self) {
        let _ = self.events.send(SessionEvent::Close).await;
        if let Err(error) = self.task.await {
            warn!(
                event_name = "session.task_join_failed",
                session_id = %self.session_id,
                error = %error,
                "session task ended abnormally"
            );
        }
    }
}

/// Handshake: the tenant must exist before the session goes `Active`.
pub async fn open_session(
    context: Arc<AgentContext>,
    tenant_id: TenantId,
    outbound: mpsc::Sender<OutboundMessage>,
) -> Result<SessionHandle, ApplicationError> {
    let kb = context.knowledge().open(&tenant_id).await?;

    let mut session = Session::new(tenant_id.clone());
    session.transition_to(SessionState::Active)?;
    let session_id = session.id.clone();

    let (events, receiver) = mpsc::channel(context.config().agent.session_queue_capacity);
    context.sessions().register(session_id.clone(), events.clone()).await;
    info!(
        event_name = "session.opened",
        session_id = %session_id,
        tenant_id = %tenant_id,
        "conversation session opened"
    );

    let poll_every = Duration::from_millis(context.config().agent.handoff_poll_ms);
    let worker =
        SessionWorker { context, kb, session, outbound, pending: VecDeque::new(), poll_every };
    let task = tokio::spawn(worker.run(receiver));
    Ok(SessionHandle { session_id, tenant_id, events, task })
}

struct SessionWorker {
    context: Arc<AgentContext>,
    kb: KnowledgeBase,
    session: Session,
    outbound: mpsc::Sender<OutboundMessage>,
    /// Already in history; waiting for their turn.
    pending: VecDeque<String>,
    poll_every: Duration,
}

enum Flow {
    Continue,
    Stop,
}

impl SessionWorker {
    async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        let mut poll = tokio::time::interval(self.poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.session.state == SessionState::Active {
                if let Some(text) = self.pending.pop_front() {
                    if let Flow::Stop = self.dispatch(text, &mut events).await {
                        break;
                    }
                    continue;
                }
            }

            let event = if self.session.state == SessionState::AwaitingHuman {
                tokio::select! {
                    event = events.recv() => event,
                    _ = poll.tick() => {
                        if let Flow::Stop = self.poll_resolution().await {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                events.recv().await
            };
            let Some(event) = event else {
                break;
            };
            if let Flow::Stop = self.handle_event(event).await {
                break;
            }
        }

        self.shutdown().await;
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::UserMessage(text) => self.accept(text).await,
            SessionEvent::HumanResolved { request_id, text } => self.resume(request_id, text).await,
            SessionEvent::Snapshot(reply) => {
                let _ = reply.send(self.session.clone());
                Flow::Continue
            }
            SessionEvent::Close => Flow::Stop,
        }
    }

    /// Records the message on arrival so history keeps arrival order no
    /// matter when its turn runs.
    async fn accept(&mut self, text: String) -> Flow {
        if text.trim().is_empty() {
            return self.send(OutboundMessage::Error { message: BLANK_MESSAGE.to_string() }).await;
        }
        self.session.record(Role::User, text.as_str());
        if self.session.state != SessionState::Active || !self.pending.is_empty() {
            debug!(
                event_name = "session.message_queued",
                session_id = %self.session.id,
                state = ?self.session.state,
                queued = self.pending.len() + 1,
                "message queued behind the current turn or handoff"
            );
        }
        self.pending.push_back(text);
        Flow::Continue
    }

    async fn resume(&mut self, request_id: HandoffRequestId, text: String) -> Flow {
        if self.session.state != SessionState::AwaitingHuman {
            debug!(
                event_name = "session.resolution_already_applied",
                session_id = %self.session.id,
                request_id = %request_id,
                "no handoff pending; resolution ignored"
            );
            return Flow::Continue;
        }
        if let Err(error) = self.session.resume_from_human(&request_id, text.as_str()) {
            warn!(
                event_name = "session.resolution_ignored",
                session_id = %self.session.id,
                request_id = %request_id,
                error = %error,
                "resolution does not match the pending handoff"
            );
            return Flow::Continue;
        }
        info!(
            event_name = "session.resumed",
            session_id = %self.session.id,
            request_id = %request_id,
            queued = self.pending.len(),
            "human reply delivered; session active again"
        );
        self.send(OutboundMessage::Answer { text }).await
    }

    /// Picks up resolutions written by another process, which cannot reach
    /// this session's channel.
    async fn poll_resolution(&mut self) -> Flow {
        let Some(request_id) = self.session.pending_handoff.clone() else {
            return Flow::Continue;
        };
        match self.context.handoffs().get(&request_id).await {
            Ok(Some(request)) if !request.is_pending() => {
                let text = request.response_text.unwrap_or_default();
                self.resume(request_id, text).await
            }
            Ok(_) => Flow::Continue,
            Err(error) => {
                warn!(
                    event_name = "session.handoff_poll_failed",
                    session_id = %self.session.id,
                    request_id = %request_id,
                    error = %error,
                    "could not check handoff request"
                );
                Flow::Continue
            }
        }
    }

    /// Runs one turn while still draining the event channel, so messages
    /// that arrive mid-turn queue up and `Close` drops the turn.
    async fn dispatch(&mut self, text: String, events: &mut mpsc::Receiver<SessionEvent>) -> Flow {
        let runtime = self.context.runtime().clone();
        let kb = self.kb.clone();
        let turn = runtime.run_turn(&kb, &text);
        tokio::pin!(turn);

        let outcome = loop {
            tokio::select! {
                outcome = &mut turn => break outcome,
                event = events.recv() => match event {
                    Some(SessionEvent::UserMessage(incoming)) => {
                        if let Flow::Stop = self.accept(incoming).await {
                            return Flow::Stop;
                        }
                    }
                    Some(SessionEvent::Snapshot(reply)) => {
                        let _ = reply.send(self.session.clone());
                    }
                    Some(SessionEvent::HumanResolved { request_id, .. }) => {
                        debug!(
                            event_name = "session.resolution_ignored",
                            session_id = %self.session.id,
                            request_id = %request_id,
                            "resolution arrived while no handoff was pending"
                        );
                    }
                    Some(SessionEvent::Close) | None => {
                        debug!(
                            event_name = "session.turn_cancelled",
                            session_id = %self.session.id,
                            "in-flight turn dropped on close"
                        );
                        return Flow::Stop;
                    }
                },
            }
        };

        self.apply(outcome).await
    }

    async fn apply(&mut self, outcome: TurnOutcome) -> Flow {
        match outcome {
            TurnOutcome::Answer { text } => {
                self.session.record(Role::Assistant, text.as_str());
                self.send(OutboundMessage::Answer { text }).await
            }
            TurnOutcome::Handoff { query } => {
                let enqueued = self
                    .context
                    .handoffs()
                    .enqueue(self.session.id.clone(), self.kb.tenant_id().clone(), &query)
                    .await;
                match enqueued {
                    Ok(request) => {
                        if let Err(error) = self.session.await_human(request.request_id.clone()) {
                            warn!(
                                event_name = "session.transition_rejected",
                                session_id = %self.session.id,
                                error = %error,
                                "could not enter awaiting-human state"
                            );
                        }
                        self.send(OutboundMessage::Handoff { query }).await
                    }
                    Err(error) => {
                        warn!(
                            event_name = "session.handoff_enqueue_failed",
                            session_id = %self.session.id,
                            error = %error,
                            "failed to enqueue handoff request"
                        );
                        self.send(OutboundMessage::Error { message: HANDOFF_UNAVAILABLE.to_string() })
                            .await
                    }
                }
            }
            TurnOutcome::GenerationFailure { message } => {
                self.send(OutboundMessage::Error { message }).await
            }
        }
    }

    async fn send(&self, message: OutboundMessage) -> Flow {
        if self.outbound.send(message).await.is_err() {
            debug!(
                event_name = "session.outbound_closed",
                session_id = %self.session.id,
                "client went away; closing session"
            );
            return Flow::Stop;
        }
        Flow::Continue
    }

    async fn shutdown(mut self) {
        let pending_handoff = self.session.pending_handoff.clone();
        self.session.close();
        self.pending.clear();
        self.context.sessions().unregister(&self.session.id).await;
        info!(
            event_name = "session.closed",
            session_id = %self.session.id,
            tenant_id = %self.session.tenant_id,
            pending_handoff = pending_handoff.as_ref().map(|id| id.as_str()),
            "conversation session closed"
        );
    }
}
