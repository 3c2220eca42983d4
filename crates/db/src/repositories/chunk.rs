use sqlx::{sqlite::SqliteRow, Row};

use concierge_core::domain::chunk::{decode_embedding, encode_embedding, Chunk};
use concierge_core::domain::tenant::TenantId;

use super::{parse_timestamp, ChunkRepository, RepositoryError};
use crate::DbPool;

pub struct SqlChunkRepository {
    pool: DbPool,
}

impl SqlChunkRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ChunkRepository for SqlChunkRepository {
    async fn append(&self, chunks: Vec<Chunk>) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        for chunk in &chunks {
            let index = i64::try_from(chunk.index).map_err(|_| {
                RepositoryError::Conflict(format!("chunk index {} out of range", chunk.index))
            })?;

            sqlx::query(
                "INSERT INTO kb_chunk (
                    tenant_id,
                    chunk_index,
                    text,
                    embedding,
                    source_ref,
                    created_at
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(chunk.tenant_id.as_str())
            .bind(index)
            .bind(&chunk.text)
            .bind(encode_embedding(&chunk.embedding))
            .bind(&chunk.source_ref)
            .bind(chunk.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_for_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Chunk>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT tenant_id, chunk_index, text, embedding, source_ref, created_at
             FROM kb_chunk
             WHERE tenant_id = ?
             ORDER BY chunk_index ASC",
        )
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(chunk_from_row).collect()
    }

    async fn count_for_tenant(&self, tenant_id: &TenantId) -> Result<u64, RepositoryError> {
        let count = sqlx::query("SELECT COUNT(*) AS count FROM kb_chunk WHERE tenant_id = ?")
            .bind(tenant_id.as_str())
            .fetch_one(&self.pool)
            .await?
            .try_get::<i64, _>("count")?;

        u64::try_from(count)
            .map_err(|_| RepositoryError::Decode(format!("negative chunk count {count}")))
    }

    async fn first_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Chunk>, RepositoryError> {
        let row = sqlx::query(
            "SELECT tenant_id, chunk_index, text, embedding, source_ref, created_at
             FROM kb_chunk
             WHERE tenant_id = ?
             ORDER BY chunk_index ASC
             LIMIT 1",
        )
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(chunk_from_row).transpose()
    }

    async fn delete_for_tenant(&self, tenant_id: &TenantId) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM kb_chunk WHERE tenant_id = ?")
            .bind(tenant_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn chunk_from_row(row: SqliteRow) -> Result<Chunk, RepositoryError> {
    let raw_tenant = row.try_get::<String, _>("tenant_id")?;
    let tenant_id = TenantId::parse(raw_tenant.clone()).map_err(|error| {
        RepositoryError::Decode(format!("invalid tenant id `{raw_tenant}`: {error}"))
    })?;

    let raw_index = row.try_get::<i64, _>("chunk_index")?;
    let index = u64::try_from(raw_index)
        .map_err(|_| RepositoryError::Decode(format!("negative chunk_index {raw_index}")))?;

    let blob = row.try_get::<Vec<u8>, _>("embedding")?;
    let embedding = decode_embedding(&blob).ok_or_else(|| {
        RepositoryError::Decode(format!(
            "embedding blob for chunk {index} has {} bytes, not a multiple of 4",
            blob.len()
        ))
    })?;

    Ok(Chunk {
        tenant_id,
        index,
        text: row.try_get("text")?,
        embedding,
        source_ref: row.try_get("source_ref")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use concierge_core::domain::chunk::Chunk;
    use concierge_core::domain::tenant::{Tenant, TenantId};

    use super::SqlChunkRepository;
    use crate::migrations;
    use crate::repositories::{ChunkRepository, SqlTenantRepository, TenantRepository};
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_chunk_repo_round_trips_embeddings_in_index_order() {
        let pool = setup_pool().await;
        let tenant_id = insert_tenant(&pool, "acme").await;
        let repo = SqlChunkRepository::new(pool.clone());
        let chunks = vec![
            sample_chunk(&tenant_id, 0, "Returns are accepted within 30 days.", vec![0.5, -1.25]),
            sample_chunk(&tenant_id, 1, "Shipping is free over $50.", vec![0.0, 3.0]),
        ];

        repo.append(chunks.clone()).await.expect("append");

        assert_eq!(repo.list_for_tenant(&tenant_id).await.expect("list"), chunks);
        assert_eq!(repo.count_for_tenant(&tenant_id).await.expect("count"), 2);
        assert_eq!(repo.first_for_tenant(&tenant_id).await.expect("first"), Some(chunks[0].clone()));

        pool.close().await;
    }

    #[tokio::test]
    async fn sql_chunk_repo_rejects_duplicate_index_atomically() {
        let pool = setup_pool().await;
        let tenant_id = insert_tenant(&pool, "acme").await;
        let repo = SqlChunkRepository::new(pool.clone());
        repo.append(vec![sample_chunk(&tenant_id, 0, "first", vec![1.0])]).await.expect("append");

        let result = repo
            .append(vec![
                sample_chunk(&tenant_id, 1, "second", vec![1.0]),
                sample_chunk(&tenant_id, 0, "clash", vec![1.0]),
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(repo.count_for_tenant(&tenant_id).await.expect("count"), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn deleting_tenant_cascades_to_chunks() {
        let pool = setup_pool().await;
        let tenant_id = insert_tenant(&pool, "acme").await;
        let other = insert_tenant(&pool, "globex").await;
        let repo = SqlChunkRepository::new(pool.clone());
        repo.append(vec![sample_chunk(&tenant_id, 0, "acme text", vec![1.0])]).await.expect("append");
        repo.append(vec![sample_chunk(&other, 0, "globex text", vec![1.0])]).await.expect("append");

        SqlTenantRepository::new(pool.clone()).delete(&tenant_id).await.expect("delete tenant");

        assert_eq!(repo.count_for_tenant(&tenant_id).await.expect("count"), 0);
        assert_eq!(repo.count_for_tenant(&other).await.expect("count"), 1);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn insert_tenant(pool: &DbPool, id: &str) -> TenantId {
        let tenant = Tenant {
            id: TenantId::parse(id).expect("tenant id"),
            name: None,
            created_at: parse_ts("2026-03-01T09:00:00Z"),
        };
        SqlTenantRepository::new(pool.clone()).create_if_absent(tenant).await.expect("tenant").id
    }

    fn sample_chunk(tenant_id: &TenantId, index: u64, text: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            tenant_id: tenant_id.clone(),
            index,
            text: text.to_string(),
            embedding,
            source_ref: "policy.json".to_string(),
            created_at: parse_ts("2026-03-01T09:05:00Z"),
        }
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
