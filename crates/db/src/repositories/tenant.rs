use sqlx::{sqlite::SqliteRow, Row};

use concierge_core::domain::tenant::{Tenant, TenantId};

use super::{parse_timestamp, RepositoryError, TenantRepository};
use crate::DbPool;

pub struct SqlTenantRepository {
    pool: DbPool,
}

impl SqlTenantRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TenantRepository for SqlTenantRepository {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, created_at FROM tenant WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(tenant_from_row).transpose()
    }

    async fn create_if_absent(&self, tenant: Tenant) -> Result<Tenant, RepositoryError> {
        sqlx::query(
            "INSERT INTO tenant (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(tenant.id.as_str())
        .bind(tenant.name.as_deref())
        .bind(tenant.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.find_by_id(&tenant.id).await?.ok_or_else(|| {
            RepositoryError::Conflict(format!("tenant `{}` vanished after insert", tenant.id))
        })
    }

    async fn list(&self) -> Result<Vec<Tenant>, RepositoryError> {
        let rows = sqlx::query("SELECT id, name, created_at FROM tenant ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(tenant_from_row).collect()
    }

    async fn delete(&self, id: &TenantId) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM tenant WHERE id = ?").bind(id.as_str()).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }
}

fn tenant_from_row(row: SqliteRow) -> Result<Tenant, RepositoryError> {
    let raw_id = row.try_get::<String, _>("id")?;
    let id = TenantId::parse(raw_id.clone())
        .map_err(|error| RepositoryError::Decode(format!("invalid tenant id `{raw_id}`: {error}")))?;

    Ok(Tenant {
        id,
        name: row.try_get("name")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use concierge_core::domain::tenant::{Tenant, TenantId};

    use super::SqlTenantRepository;
    use crate::migrations;
    use crate::repositories::TenantRepository;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_tenant_repo_create_is_idempotent() {
        let pool = setup_pool().await;
        let repo = SqlTenantRepository::new(pool.clone());
        let first = sample_tenant("acme", Some("Acme Outfitters"));

        let stored = repo.create_if_absent(first.clone()).await.expect("create");
        let again = repo
            .create_if_absent(Tenant { name: Some("Renamed".to_string()), ..first.clone() })
            .await
            .expect("create again");

        assert_eq!(stored, first);
        assert_eq!(again, first);
        assert_eq!(repo.list().await.expect("list"), vec![first]);

        pool.close().await;
    }

    #[tokio::test]
    async fn sql_tenant_repo_delete_reports_missing_tenants() {
        let pool = setup_pool().await;
        let repo = SqlTenantRepository::new(pool.clone());
        let tenant = sample_tenant("globex", None);
        repo.create_if_absent(tenant.clone()).await.expect("create");

        assert!(repo.delete(&tenant.id).await.expect("delete"));
        assert!(!repo.delete(&tenant.id).await.expect("delete again"));
        assert_eq!(repo.find_by_id(&tenant.id).await.expect("find"), None);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_tenant(id: &str, name: Option<&str>) -> Tenant {
        Tenant {
            id: TenantId::parse(id).expect("tenant id"),
            name: name.map(str::to_string),
            created_at: parse_ts("2026-03-01T09:00:00Z"),
        }
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
