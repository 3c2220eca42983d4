use std::sync::Arc;

use concierge_agent::AgentContext;
use concierge_core::config::{AppConfig, ConfigError, LoadOptions};
use concierge_core::errors::ApplicationError;
use concierge_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub context: Arc<AgentContext>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("agent context could not be built: {0}")]
    Context(#[source] ApplicationError),
}

#[cfg_attr(not(test), allow(dead_code))]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let context = AgentContext::from_pool(config.clone(), db_pool.clone())
        .map_err(BootstrapError::Context)?;

    Ok(Application { config, db_pool, context: Arc::new(context) })
}

#[cfg(test)]
mod tests {
    use concierge_core::config::{ConfigOverrides, EmbeddingBackend, LlmBackend, LoadOptions};
    use concierge_core::domain::tenant::TenantId;
    use concierge_core::ingest::RawInput;

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str) -> ConfigOverrides {
        ConfigOverrides {
            database_url: Some(database_url.to_string()),
            embedding_backend: Some(EmbeddingBackend::Hashing),
            ..ConfigOverrides::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_required_llm_key() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                llm_backend: Some(LlmBackend::OpenAi),
                ..overrides("sqlite::memory:")
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("llm.api_key"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_wires_sqlite_stores() {
        let app = bootstrap(LoadOptions {
            overrides: overrides("sqlite::memory:?cache=shared"),
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('tenant', 'kb_chunk', 'handoff_request')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected baseline tables after bootstrap");
        assert_eq!(table_count, 3);

        let report = app
            .context
            .ingest(
                Some(TenantId::parse("boot").expect("id")),
                None,
                RawInput::Text("Support is available around the clock.".to_string()),
                "boot.txt",
            )
            .await
            .expect("ingest through sqlite stores");
        assert_eq!(report.chunk_count, 1);

        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kb_chunk WHERE tenant_id = 'boot'")
            .fetch_one(&app.db_pool)
            .await
            .expect("count chunks");
        assert_eq!(stored, 1);

        app.db_pool.close().await;
    }
}
