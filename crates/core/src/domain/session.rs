use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::handoff::HandoffRequestId;
use crate::domain::tenant::TenantId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("sess-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    AwaitingHuman,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    HumanAgent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub state: SessionState,
    pub history: Vec<HistoryEntry>,
    pub pending_handoff: Option<HandoffRequestId>,
}

impl Session {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            id: SessionId::generate(),
            tenant_id,
            state: SessionState::Connecting,
            history: Vec::new(),
            pending_handoff: None,
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self.state, next),
            (SessionState::Connecting, SessionState::Active)
                | (SessionState::Active, SessionState::Active)
                | (SessionState::Active, SessionState::AwaitingHuman)
                | (SessionState::AwaitingHuman, SessionState::Active)
                | (_, SessionState::Closed)
        )
    }

    pub fn transition_to(&mut self, next: SessionState) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.state = next;
            return Ok(());
        }

        Err(DomainError::InvalidSessionTransition { from: self.state, to: next })
    }

    pub fn record(&mut self, role: Role, text: impl Into<String>) {
        self.history.push(HistoryEntry { role, text: text.into(), timestamp: Utc::now() });
    }

    pub fn await_human(&mut self, request_id: HandoffRequestId) -> Result<(), DomainError> {
        self.transition_to(SessionState::AwaitingHuman)?;
        self.pending_handoff = Some(request_id);
        Ok(())
    }

    /// Leaves `AwaitingHuman` once the paired request is resolved; replies for
    /// any other request are rejected.
    pub fn resume_from_human(
        &mut self,
        request_id: &HandoffRequestId,
        reply: impl Into<String>,
    ) -> Result<(), DomainError> {
        if self.pending_handoff.as_ref() != Some(request_id) {
            return Err(DomainError::UnknownRequest(request_id.to_string()));
        }
        self.transition_to(SessionState::Active)?;
        self.pending_handoff = None;
        self.record(Role::HumanAgent, reply);
        Ok(())
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.pending_handoff = None;
        self.history.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}
