use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use concierge_core::domain::handoff::{HandoffRequest, HandoffRequestId};
use concierge_core::domain::session::SessionId;
use concierge_core::domain::tenant::TenantId;
use concierge_core::errors::{ApplicationError, DomainError};
use concierge_db::repositories::HandoffRepository;

use crate::conversation::{SessionEvent, SessionRegistry};
use crate::knowledge::KnowledgeBaseManager;

/// Pending human-escalation requests and their resolution.
pub struct HandoffQueue {
    requests: Arc<dyn HandoffRepository>,
    knowledge: Arc<KnowledgeBaseManager>,
    sessions: SessionRegistry,
    resolve_lock: Mutex<()>,
}

impl HandoffQueue {
    pub fn new(
        requests: Arc<dyn HandoffRepository>,
        knowledge: Arc<KnowledgeBaseManager>,
        sessions: SessionRegistry,
    ) -> Self {
        Self { requests, knowledge, sessions, resolve_lock: Mutex::new(()) }
    }

    pub async fn enqueue(
        &self,
        session_id: SessionId,
        tenant_id: TenantId,
        query_text: &str,
    ) -> Result<HandoffRequest, ApplicationError> {
        let request = HandoffRequest::new(session_id, tenant_id, query_text);
        self.requests.insert(request.clone()).await?;
        info!(
            event_name = "handoff.enqueued",
            request_id = %request.request_id,
            session_id = %request.session_id,
            tenant_id = %request.tenant_id,
            "handoff request waiting for a human"
        );
        Ok(request)
    }

    /// Oldest first.
    pub async fn pending(&self) -> Result<Vec<HandoffRequest>, ApplicationError> {
        Ok(self.requests.list_pending().await?)
    }

    pub async fn get(
        &self,
        request_id: &HandoffRequestId,
    ) -> Result<Option<HandoffRequest>, ApplicationError> {
        Ok(self.requests.find_by_id(request_id).await?)
    }

    /// Resolves a pending request exactly once. With `update_kb` the reply is
    /// added to the tenant's knowledge base first; the request stays pending
    /// if that write fails.
    pub async fn resolve(
        &self,
        request_id: &HandoffRequestId,
        response_text: &str,
        update_kb: bool,
    ) -> Result<HandoffRequest, ApplicationError> {
        let _guard = self.resolve_lock.lock().await;

        let mut request = self
            .requests
            .find_by_id(request_id)
            .await?
            .filter(HandoffRequest::is_pending)
            .ok_or_else(|| DomainError::UnknownRequest(request_id.to_string()))?;

        let response_text = response_text.trim();
        if response_text.is_empty() {
            return Err(DomainError::MissingInput { field: "response_text" }.into());
        }

        if update_kb {
            let kb = self.knowledge.open(&request.tenant_id).await?;
            let chunk = self
                .knowledge
                .add(&kb, response_text, &format!("handoff:{}", request.request_id))
                .await?;
            info!(
                event_name = "handoff.kb_updated",
                request_id = %request.request_id,
                tenant_id = %request.tenant_id,
                chunk_index = chunk.index,
                "human reply added to knowledge base"
            );
        }

        request.resolve(response_text)?;
        if !self.requests.mark_resolved(&request).await? {
            return Err(DomainError::UnknownRequest(request_id.to_string()).into());
        }

        let delivered = self
            .sessions
            .notify(
                &request.session_id,
                SessionEvent::HumanResolved {
                    request_id: request.request_id.clone(),
                    text: response_text.to_string(),
                },
            )
            .await;
        if delivered {
            info!(
                event_name = "handoff.resolved",
                request_id = %request.request_id,
                session_id = %request.session_id,
                update_kb,
                "handoff resolved and delivered"
            );
        } else {
            warn!(
                event_name = "handoff.resolved_offline",
                request_id = %request.request_id,
                session_id = %request.session_id,
                update_kb,
                "handoff resolved but the session is no longer live"
            );
        }

        Ok(request)
    }
}
