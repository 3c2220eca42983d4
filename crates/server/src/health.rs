use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use concierge_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub knowledge_bases: Option<i64>,
    pub pending_handoffs: Option<i64>,
    pub checked_at: String,
}

/// Liveness plus a database round trip; merged into the API router at startup.
pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";
    let (knowledge_bases, pending_handoffs) = if ready {
        (
            count(&state.db_pool, "SELECT COUNT(*) FROM tenant").await,
            count(&state.db_pool, "SELECT COUNT(*) FROM handoff_request WHERE status = 'pending'")
                .await,
        )
    } else {
        (None, None)
    };

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "concierge-server runtime initialized".to_string(),
        },
        database,
        knowledge_bases,
        pending_handoffs,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn count(pool: &DbPool, query: &str) -> Option<i64> {
    sqlx::query_scalar::<_, i64>(query).fetch_one(pool).await.ok()
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use concierge_db::{connect_with_settings, migrations};

    use crate::health::{health, HealthState};

    #[tokio::test]
    async fn ready_health_reports_store_counts() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");
        sqlx::query("INSERT INTO tenant (id, name, created_at) VALUES ('acme', NULL, '2026-01-01T00:00:00Z')")
            .execute(&pool)
            .await
            .expect("seed tenant");

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool.clone() })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.knowledge_bases, Some(1));
        assert_eq!(payload.pending_handoffs, Some(0));

        pool.close().await;
    }

    #[tokio::test]
    async fn unmigrated_database_is_ready_without_counts() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool.clone() })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.knowledge_bases, None);

        pool.close().await;
    }

    #[tokio::test]
    async fn closed_pool_is_service_unavailable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
        assert_eq!(payload.pending_handoffs, None);
    }
}
