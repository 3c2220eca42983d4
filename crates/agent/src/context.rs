//! Process-wide wiring, built once at startup and shared by reference.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use concierge_core::config::AppConfig;
use concierge_core::domain::tenant::TenantId;
use concierge_core::errors::ApplicationError;
use concierge_core::ingest::{IngestionPipeline, RawInput};
use concierge_core::search::ExactSearch;
use concierge_db::repositories::{
    ChunkRepository, HandoffRepository, InMemoryChunkRepository, InMemoryHandoffRepository,
    InMemoryTenantRepository, SqlChunkRepository, SqlHandoffRepository, SqlTenantRepository,
    TenantRepository,
};
use concierge_db::DbPool;

use crate::conversation::SessionRegistry;
use crate::guardrails::EscalationPolicy;
use crate::handoff::HandoffQueue;
use crate::knowledge::KnowledgeBaseManager;
use crate::llm::{
    embedding_provider_from_config, generation_provider_from_config, EmbeddingProvider,
    GenerationProvider,
};
use crate::runtime::{AgentRuntime, RetryPolicy};
use crate::tools::{AnswerCapability, RetrievalCapability, Toolbox};

const MAX_RETRY_DELAY_MS: u64 = 5_000;

pub struct Stores {
    pub tenants: Arc<dyn TenantRepository>,
    pub chunks: Arc<dyn ChunkRepository>,
    pub handoffs: Arc<dyn HandoffRepository>,
}

impl Stores {
    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            tenants: Arc::new(SqlTenantRepository::new(pool.clone())),
            chunks: Arc::new(SqlChunkRepository::new(pool.clone())),
            handoffs: Arc::new(SqlHandoffRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            tenants: Arc::new(InMemoryTenantRepository::default()),
            chunks: Arc::new(InMemoryChunkRepository::default()),
            handoffs: Arc::new(InMemoryHandoffRepository::default()),
        }
    }
}

pub struct Providers {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn GenerationProvider>,
    pub embed_timeout: Duration,
    pub generate_timeout: Duration,
}

impl Providers {
    pub fn from_config(config: &AppConfig) -> Result<Self, ApplicationError> {
        let embedder = embedding_provider_from_config(&config.embedding)
            .map_err(|error| ApplicationError::Configuration(format!("embedding provider: {error}")))?;
        let generator = generation_provider_from_config(&config.llm)
            .map_err(|error| ApplicationError::Configuration(format!("generation provider: {error}")))?;
        Ok(Self {
            embedder,
            generator,
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            generate_timeout: Duration::from_secs(config.llm.timeout_secs),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub tenant_id: TenantId,
    pub chunk_count: usize,
}

pub struct AgentContext {
    config: AppConfig,
    ingestion: IngestionPipeline,
    knowledge: Arc<KnowledgeBaseManager>,
    runtime: Arc<AgentRuntime>,
    handoffs: Arc<HandoffQueue>,
    sessions: SessionRegistry,
}

impl AgentContext {
    pub fn from_pool(config: AppConfig, pool: DbPool) -> Result<Self, ApplicationError> {
        let providers = Providers::from_config(&config)?;
        Self::assemble(config, Stores::sqlite(pool), providers)
    }

    pub fn assemble(
        config: AppConfig,
        stores: Stores,
        providers: Providers,
    ) -> Result<Self, ApplicationError> {
        let knowledge = Arc::new(KnowledgeBaseManager::new(
            stores.tenants,
            stores.chunks,
            providers.embedder,
            Arc::new(ExactSearch::new(config.retrieval.metric)),
            config.embedding.dimensions,
            providers.embed_timeout,
        ));

        let policy = EscalationPolicy::new(config.agent.escalation_sentinel.clone());
        let answer =
            AnswerCapability::new(providers.generator, policy.clone(), providers.generate_timeout)?;
        let toolbox = Toolbox::new(
            knowledge.clone(),
            RetrievalCapability::new(knowledge.clone(), config.retrieval.top_k),
            answer,
        );
        let retry = RetryPolicy {
            max_retries: config.llm.max_retries,
            base_delay_ms: config.agent.retry_base_delay_ms,
            max_delay_ms: MAX_RETRY_DELAY_MS,
        };
        let runtime =
            Arc::new(AgentRuntime::new(Arc::new(toolbox), policy, config.agent.max_steps, retry));

        let sessions = SessionRegistry::default();
        let handoffs =
            Arc::new(HandoffQueue::new(stores.handoffs, knowledge.clone(), sessions.clone()));

        info!(
            event_name = "agent.context_ready",
            llm_backend = ?config.llm.backend,
            embedding_backend = ?config.embedding.backend,
            dimensions = config.embedding.dimensions,
            max_steps = config.agent.max_steps,
            "agent context assembled"
        );

        Ok(Self {
            ingestion: IngestionPipeline::new(config.ingestion),
            config,
            knowledge,
            runtime,
            handoffs,
            sessions,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBaseManager> {
        &self.knowledge
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    pub fn handoffs(&self) -> &Arc<HandoffQueue> {
        &self.handoffs
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Extract, chunk and store `input`. A missing id mints a fresh tenant; an
    /// existing id appends to that tenant's store.
    pub async fn ingest(
        &self,
        tenant_id: Option<TenantId>,
        name: Option<String>,
        input: RawInput,
        source_ref: &str,
    ) -> Result<IngestReport, ApplicationError> {
        let chunks = self.ingestion.prepare(&input)?;
        let tenant_id = tenant_id.unwrap_or_else(TenantId::generate);
        let kb = self.knowledge.create_or_get(tenant_id, name).await?;
        let stored = self.knowledge.populate(&kb, chunks, source_ref).await?;

        info!(
            event_name = "kb.ingested",
            tenant_id = %kb.tenant_id(),
            source_ref,
            chunk_count = stored.len(),
            "payload ingested"
        );
        Ok(IngestReport { tenant_id: kb.tenant_id().clone(), chunk_count: stored.len() })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use concierge_core::domain::tenant::TenantId;
    use concierge_core::errors::{ApplicationError, DomainError};
    use concierge_core::ingest::RawInput;

    use crate::testing::{test_context, ScriptedGenerator};

    #[tokio::test]
    async fn ingest_without_id_mints_tenant() {
        let context = test_context(ScriptedGenerator::answering(["unused"]));

        let report = context
            .ingest(None, Some("Acme".to_string()), RawInput::Json(json!({"faq": "Open daily."})), "faq.json")
            .await
            .expect("ingest");

        assert_eq!(report.chunk_count, 1);
        let listed = context.knowledge().list().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tenant_id, report.tenant_id);
        assert_eq!(listed[0].name.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn reingest_appends_to_existing_tenant() {
        let context = test_context(ScriptedGenerator::answering(["unused"]));
        let tenant = TenantId::parse("acme").expect("id");

        context
            .ingest(Some(tenant.clone()), None, RawInput::Text("First fact.".to_string()), "a.txt")
            .await
            .expect("first");
        context
            .ingest(Some(tenant.clone()), None, RawInput::Text("Second fact.".to_string()), "b.txt")
            .await
            .expect("second");

        let kb = context.knowledge().open(&tenant).await.expect("open");
        assert_eq!(context.knowledge().chunk_count(&kb).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn malformed_payload_creates_nothing() {
        let context = test_context(ScriptedGenerator::answering(["unused"]));

        let error = context
            .ingest(None, None, RawInput::Json(json!({"count": 3})), "bad.json")
            .await
            .expect_err("malformed");

        assert!(matches!(error, ApplicationError::Domain(DomainError::MalformedInput(_))));
        assert!(context.knowledge().list().await.expect("list").is_empty());
    }
}
