use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::SessionId;
use crate::domain::tenant::TenantId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandoffRequestId(pub String);

impl HandoffRequestId {
    pub fn generate() -> Self {
        Self(format!("hr-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandoffRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Resolved,
}

impl HandoffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for HandoffStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            other => Err(DomainError::MalformedInput(format!("unknown handoff status `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub request_id: HandoffRequestId,
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub query_text: String,
    pub status: HandoffStatus,
    pub created_at: DateTime<Utc>,
    pub response_text: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HandoffRequest {
    pub fn new(session_id: SessionId, tenant_id: TenantId, query_text: impl Into<String>) -> Self {
        Self {
            request_id: HandoffRequestId::generate(),
            session_id,
            tenant_id,
            query_text: query_text.into(),
            status: HandoffStatus::Pending,
            created_at: Utc::now(),
            response_text: None,
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == HandoffStatus::Pending
    }

    /// pending -> resolved, exactly once.
    pub fn resolve(&mut self, response_text: impl Into<String>) -> Result<(), DomainError> {
        if !self.is_pending() {
            return Err(DomainError::UnknownRequest(self.request_id.to_string()));
        }
        self.status = HandoffStatus::Resolved;
        self.response_text = Some(response_text.into());
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{HandoffRequest, HandoffStatus};
    use crate::domain::session::SessionId;
    use crate::domain::tenant::TenantId;
    use crate::errors::DomainError;

    #[test]
    fn resolves_exactly_once() {
        let mut request = HandoffRequest::new(
            SessionId::generate(),
            TenantId::parse("acme").expect("tenant id"),
            "Do you ship to Mars?",
        );

        request.resolve("Not yet.").expect("first resolve");
        let error = request.resolve("Changed my mind.").expect_err("second resolve");

        assert_eq!(request.status, HandoffStatus::Resolved);
        assert_eq!(request.response_text.as_deref(), Some("Not yet."));
        assert!(request.resolved_at.is_some());
        assert!(matches!(error, DomainError::UnknownRequest(_)));
    }

    #[test]
    fn status_round_trips_through_storage_strings() {
        assert_eq!("pending".parse::<HandoffStatus>(), Ok(HandoffStatus::Pending));
        assert_eq!(HandoffStatus::Resolved.as_str(), "resolved");
        assert!("open".parse::<HandoffStatus>().is_err());
    }
}
