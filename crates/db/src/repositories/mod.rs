use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use concierge_core::domain::chunk::Chunk;
use concierge_core::domain::handoff::{HandoffRequest, HandoffRequestId};
use concierge_core::domain::tenant::{Tenant, TenantId};
use concierge_core::errors::ApplicationError;

pub mod chunk;
pub mod handoff;
pub mod memory;
pub mod tenant;

pub use chunk::SqlChunkRepository;
pub use handoff::SqlHandoffRepository;
pub use memory::{InMemoryChunkRepository, InMemoryHandoffRepository, InMemoryTenantRepository};
pub use tenant::SqlTenantRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        Self::Persistence(error.to_string())
    }
}

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError>;

    /// Stores `tenant` unless the id already exists; returns the stored record.
    async fn create_if_absent(&self, tenant: Tenant) -> Result<Tenant, RepositoryError>;

    async fn list(&self) -> Result<Vec<Tenant>, RepositoryError>;

    async fn delete(&self, id: &TenantId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ChunkRepository: Send + Sync {
    /// Appends all chunks or none of them.
    async fn append(&self, chunks: Vec<Chunk>) -> Result<(), RepositoryError>;

    async fn list_for_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Chunk>, RepositoryError>;

    async fn count_for_tenant(&self, tenant_id: &TenantId) -> Result<u64, RepositoryError>;

    async fn first_for_tenant(&self, tenant_id: &TenantId)
        -> Result<Option<Chunk>, RepositoryError>;

    async fn delete_for_tenant(&self, tenant_id: &TenantId) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait HandoffRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &HandoffRequestId,
    ) -> Result<Option<HandoffRequest>, RepositoryError>;

    async fn insert(&self, request: HandoffRequest) -> Result<(), RepositoryError>;

    /// Oldest first.
    async fn list_pending(&self) -> Result<Vec<HandoffRequest>, RepositoryError>;

    /// Persists a resolution only if the stored request is still pending.
    /// Returns `false` when it was already resolved or does not exist.
    async fn mark_resolved(&self, request: &HandoffRequest) -> Result<bool, RepositoryError>;
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
