use sqlx::{sqlite::SqliteRow, Row};

use concierge_core::domain::handoff::{HandoffRequest, HandoffRequestId, HandoffStatus};
use concierge_core::domain::session::SessionId;
use concierge_core::domain::tenant::TenantId;

use super::{parse_optional_timestamp, parse_timestamp, HandoffRepository, RepositoryError};
use crate::DbPool;

pub struct SqlHandoffRepository {
    pool: DbPool,
}

impl SqlHandoffRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl HandoffRepository for SqlHandoffRepository {
    async fn find_by_id(
        &self,
        id: &HandoffRequestId,
    ) -> Result<Option<HandoffRequest>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                request_id,
                session_id,
                tenant_id,
                query_text,
                status,
                response_text,
                created_at,
                resolved_at
             FROM handoff_request
             WHERE request_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(request_from_row).transpose()
    }

    async fn insert(&self, request: HandoffRequest) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO handoff_request (
                request_id,
                session_id,
                tenant_id,
                query_text,
                status,
                response_text,
                created_at,
                resolved_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.request_id.as_str())
        .bind(request.session_id.as_str())
        .bind(request.tenant_id.as_str())
        .bind(&request.query_text)
        .bind(request.status.as_str())
        .bind(request.response_text.as_deref())
        .bind(request.created_at.to_rfc3339())
        .bind(request.resolved_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<HandoffRequest>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                request_id,
                session_id,
                tenant_id,
                query_text,
                status,
                response_text,
                created_at,
                resolved_at
             FROM handoff_request
             WHERE status = 'pending'
             ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(request_from_row).collect()
    }

    async fn mark_resolved(&self, request: &HandoffRequest) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE handoff_request
             SET status = ?, response_text = ?, resolved_at = ?
             WHERE request_id = ? AND status = 'pending'",
        )
        .bind(HandoffStatus::Resolved.as_str())
        .bind(request.response_text.as_deref())
        .bind(request.resolved_at.map(|value| value.to_rfc3339()))
        .bind(request.request_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn request_from_row(row: SqliteRow) -> Result<HandoffRequest, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = status_raw
        .parse::<HandoffStatus>()
        .map_err(|_| RepositoryError::Decode(format!("unknown handoff status `{status_raw}`")))?;

    let raw_tenant = row.try_get::<String, _>("tenant_id")?;
    let tenant_id = TenantId::parse(raw_tenant.clone()).map_err(|error| {
        RepositoryError::Decode(format!("invalid tenant id `{raw_tenant}`: {error}"))
    })?;

    Ok(HandoffRequest {
        request_id: HandoffRequestId(row.try_get("request_id")?),
        session_id: SessionId(row.try_get("session_id")?),
        tenant_id,
        query_text: row.try_get("query_text")?,
        status,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        response_text: row.try_get("response_text")?,
        resolved_at: parse_optional_timestamp("resolved_at", row.try_get("resolved_at")?)?,
    })
}
