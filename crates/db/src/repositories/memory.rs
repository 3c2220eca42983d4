use std::collections::{BTreeMap, HashMap, HashSet};

use tokio::sync::RwLock;

use concierge_core::domain::chunk::Chunk;
use concierge_core::domain::handoff::{HandoffRequest, HandoffRequestId, HandoffStatus};
use concierge_core::domain::tenant::{Tenant, TenantId};

use super::{ChunkRepository, HandoffRepository, RepositoryError, TenantRepository};

#[derive(Default)]
pub struct InMemoryTenantRepository {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

#[async_trait::async_trait]
impl TenantRepository for InMemoryTenantRepository {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(id).cloned())
    }

    async fn create_if_absent(&self, tenant: Tenant) -> Result<Tenant, RepositoryError> {
        let mut tenants = self.tenants.write().await;
        Ok(tenants.entry(tenant.id.clone()).or_insert(tenant).clone())
    }

    async fn list(&self) -> Result<Vec<Tenant>, RepositoryError> {
        let tenants = self.tenants.read().await;
        let mut listed = tenants.values().cloned().collect::<Vec<_>>();
        listed.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(listed)
    }

    async fn delete(&self, id: &TenantId) -> Result<bool, RepositoryError> {
        let mut tenants = self.tenants.write().await;
        Ok(tenants.remove(id).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryChunkRepository {
    chunks: RwLock<HashMap<TenantId, BTreeMap<u64, Chunk>>>,
}

#[async_trait::async_trait]
impl ChunkRepository for InMemoryChunkRepository {
    async fn append(&self, chunks: Vec<Chunk>) -> Result<(), RepositoryError> {
        let mut stored = self.chunks.write().await;

        let mut incoming = HashSet::new();
        for chunk in &chunks {
            let taken = stored
                .get(&chunk.tenant_id)
                .is_some_and(|tenant_chunks| tenant_chunks.contains_key(&chunk.index));
            if taken || !incoming.insert((chunk.tenant_id.clone(), chunk.index)) {
                return Err(RepositoryError::Conflict(format!(
                    "chunk {} already exists for tenant `{}`",
                    chunk.index, chunk.tenant_id
                )));
            }
        }

        for chunk in chunks {
            stored.entry(chunk.tenant_id.clone()).or_default().insert(chunk.index, chunk);
        }
        Ok(())
    }

    async fn list_for_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Chunk>, RepositoryError> {
        let stored = self.chunks.read().await;
        Ok(stored
            .get(tenant_id)
            .map(|tenant_chunks| tenant_chunks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_for_tenant(&self, tenant_id: &TenantId) -> Result<u64, RepositoryError> {
        let stored = self.chunks.read().await;
        Ok(stored.get(tenant_id).map_or(0, |tenant_chunks| tenant_chunks.len() as u64))
    }

    async fn first_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Chunk>, RepositoryError> {
        let stored = self.chunks.read().await;
        Ok(stored
            .get(tenant_id)
            .and_then(|tenant_chunks| tenant_chunks.values().next().cloned()))
    }

    async fn delete_for_tenant(&self, tenant_id: &TenantId) -> Result<u64, RepositoryError> {
        let mut stored = self.chunks.write().await;
        Ok(stored.remove(tenant_id).map_or(0, |tenant_chunks| tenant_chunks.len() as u64))
    }
}

#[derive(Default)]
pub struct InMemoryHandoffRepository {
    requests: RwLock<HashMap<HandoffRequestId, HandoffRequest>>,
}

#[async_trait::async_trait]
impl HandoffRepository for InMemoryHandoffRepository {
    async fn find_by_id(
        &self,
        id: &HandoffRequestId,
    ) -> Result<Option<HandoffRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.get(id).cloned())
    }

    async fn insert(&self, request: HandoffRequest) -> Result<(), RepositoryError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.request_id) {
            return Err(RepositoryError::Conflict(format!(
                "handoff request `{}` already exists",
                request.request_id
            )));
        }
        requests.insert(request.request_id.clone(), request);
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<HandoffRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        let mut pending =
            requests.values().filter(|request| request.is_pending()).cloned().collect::<Vec<_>>();
        pending.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.request_id.as_str().cmp(right.request_id.as_str()))
        });
        Ok(pending)
    }

    async fn mark_resolved(&self, request: &HandoffRequest) -> Result<bool, RepositoryError> {
        let mut requests = self.requests.write().await;
        match requests.get_mut(&request.request_id) {
            Some(stored) if stored.is_pending() => {
                stored.status = HandoffStatus::Resolved;
                stored.response_text = request.response_text.clone();
                stored.resolved_at = request.resolved_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
