use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use concierge_core::domain::chunk::{Chunk, ScoredChunk};
use concierge_core::domain::tenant::{Tenant, TenantId, TenantSummary};
use concierge_core::errors::{ApplicationError, DomainError};
use concierge_core::search::VectorSearch;
use concierge_db::repositories::{ChunkRepository, TenantRepository};

use crate::llm::{EmbeddingProvider, ProviderError};

/// Handle to one tenant's chunk store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnowledgeBase {
    tenant: Tenant,
}

impl KnowledgeBase {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant.id
    }

    pub fn name(&self) -> Option<&str> {
        self.tenant.name.as_deref()
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }
}

pub struct KnowledgeBaseManager {
    tenants: Arc<dyn TenantRepository>,
    chunks: Arc<dyn ChunkRepository>,
    embedder: Arc<dyn EmbeddingProvider>,
    search: Arc<dyn VectorSearch>,
    dimensions: usize,
    embed_timeout: Duration,
    write_locks: Mutex<HashMap<TenantId, Arc<Mutex<()>>>>,
}

impl KnowledgeBaseManager {
    pub fn new(
        tenants: Arc<dyn TenantRepository>,
        chunks: Arc<dyn ChunkRepository>,
        embedder: Arc<dyn EmbeddingProvider>,
        search: Arc<dyn VectorSearch>,
        dimensions: usize,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            tenants,
            chunks,
            embedder,
            search,
            dimensions,
            embed_timeout,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_or_get(
        &self,
        tenant_id: TenantId,
        name: Option<String>,
    ) -> Result<KnowledgeBase, ApplicationError> {
        let tenant = self.tenants.create_if_absent(Tenant::new(tenant_id, name)).await?;
        debug!(event_name = "kb.opened", tenant_id = %tenant.id, "knowledge base ready");
        Ok(KnowledgeBase { tenant })
    }

    pub async fn open(&self, tenant_id: &TenantId) -> Result<KnowledgeBase, ApplicationError> {
        self.tenants
            .find_by_id(tenant_id)
            .await?
            .map(|tenant| KnowledgeBase { tenant })
            .ok_or_else(|| DomainError::TenantNotFound(tenant_id.to_string()).into())
    }

    /// Embeds and appends every non-blank text in order.
    pub async fn populate(
        &self,
        kb: &KnowledgeBase,
        texts: Vec<String>,
        source_ref: &str,
    ) -> Result<Vec<Chunk>, ApplicationError> {
        let texts = texts
            .into_iter()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>();
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::with_capacity(texts.len());
        for text in texts {
            let embedding = self.embed(&text).await?;
            entries.push((text, embedding));
        }

        self.append(kb, entries, source_ref).await
    }

    pub async fn add(
        &self,
        kb: &KnowledgeBase,
        text: &str,
        source_ref: &str,
    ) -> Result<Chunk, ApplicationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DomainError::MissingInput { field: "text" }.into());
        }

        let embedding = self.embed(text).await?;
        let mut stored = self.append(kb, vec![(text.to_string(), embedding)], source_ref).await?;
        stored
            .pop()
            .ok_or_else(|| ApplicationError::Persistence("append stored no chunk".to_string()))
    }

    /// Ranks the tenant's chunks against `query_text`, best first. An empty
    /// store answers without calling the embedding provider.
    pub async fn query(
        &self,
        kb: &KnowledgeBase,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, ApplicationError> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(DomainError::MissingInput { field: "query" }.into());
        }

        let stored = self.chunks.list_for_tenant(kb.tenant_id()).await?;
        if stored.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query = self.embed(query_text).await?;
        let candidates = stored.iter().map(|chunk| chunk.embedding.as_slice()).collect::<Vec<_>>();
        let hits = self.search.search(&query, &candidates, k);

        debug!(
            event_name = "kb.query",
            tenant_id = %kb.tenant_id(),
            candidates = stored.len(),
            hits = hits.len(),
            "ranked knowledge base chunks"
        );

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                stored.get(hit.position).map(|chunk| ScoredChunk { chunk: chunk.clone(), score: hit.score })
            })
            .collect())
    }

    pub async fn chunk_count(&self, kb: &KnowledgeBase) -> Result<u64, ApplicationError> {
        Ok(self.chunks.count_for_tenant(kb.tenant_id()).await?)
    }

    pub async fn list(&self) -> Result<Vec<TenantSummary>, ApplicationError> {
        let tenants = self.tenants.list().await?;
        let mut summaries = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let count = self.chunks.count_for_tenant(&tenant.id).await?;
            let first = self.chunks.first_for_tenant(&tenant.id).await?;
            summaries.push(TenantSummary::new(
                &tenant,
                usize::try_from(count).unwrap_or(usize::MAX),
                first.as_ref().map(|chunk| chunk.text.as_str()),
            ));
        }
        Ok(summaries)
    }

    /// Removes the tenant and all of its chunks.
    pub async fn delete(&self, tenant_id: &TenantId) -> Result<(), ApplicationError> {
        let lock = self.write_lock(tenant_id).await;
        let _guard = lock.lock().await;

        if self.tenants.find_by_id(tenant_id).await?.is_none() {
            return Err(DomainError::TenantNotFound(tenant_id.to_string()).into());
        }
        let removed_chunks = self.chunks.delete_for_tenant(tenant_id).await?;
        self.tenants.delete(tenant_id).await?;
        self.write_locks.lock().await.remove(tenant_id);

        info!(event_name = "kb.deleted", tenant_id = %tenant_id, removed_chunks, "knowledge base deleted");
        Ok(())
    }

    async fn append(
        &self,
        kb: &KnowledgeBase,
        entries: Vec<(String, Vec<f32>)>,
        source_ref: &str,
    ) -> Result<Vec<Chunk>, ApplicationError> {
        let lock = self.write_lock(kb.tenant_id()).await;
        let _guard = lock.lock().await;

        if self.tenants.find_by_id(kb.tenant_id()).await?.is_none() {
            return Err(DomainError::TenantNotFound(kb.tenant_id().to_string()).into());
        }

        let next_index = self.chunks.count_for_tenant(kb.tenant_id()).await?;
        let created_at = Utc::now();
        let chunks = entries
            .into_iter()
            .zip(next_index..)
            .map(|((text, embedding), index)| Chunk {
                tenant_id: kb.tenant_id().clone(),
                index,
                text,
                embedding,
                source_ref: source_ref.to_string(),
                created_at,
            })
            .collect::<Vec<_>>();

        self.chunks.append(chunks.clone()).await?;

        info!(
            event_name = "kb.appended",
            tenant_id = %kb.tenant_id(),
            first_index = next_index,
            appended = chunks.len(),
            source_ref,
            "chunks appended to knowledge base"
        );
        Ok(chunks)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ApplicationError> {
        let embedding = match tokio::time::timeout(self.embed_timeout, self.embedder.embed(text)).await
        {
            Ok(Ok(embedding)) => embedding,
            Ok(Err(error)) => return Err(embedding_failure(error)),
            Err(_) => return Err(embedding_failure(ProviderError::Timeout(self.embed_timeout))),
        };

        if embedding.len() != self.dimensions {
            return Err(embedding_failure(ProviderError::Dimensions {
                expected: self.dimensions,
                actual: embedding.len(),
            }));
        }
        Ok(embedding)
    }

    async fn write_lock(&self, tenant_id: &TenantId) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks.entry(tenant_id.clone()).or_default().clone()
    }
}

fn embedding_failure(error: ProviderError) -> ApplicationError {
    warn!(event_name = "kb.embedding_failed", error = %error, "embedding provider call failed");
    ApplicationError::EmbeddingProvider(error.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use concierge_core::domain::tenant::{TenantId, EMPTY_KB_SUMMARY};
    use concierge_core::errors::{ApplicationError, DomainError};

    use crate::testing::{manager_with, CountingEmbedder, SlowEmbedder, TEST_DIMENSIONS};

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).expect("tenant id")
    }

    fn policy_texts() -> Vec<String> {
        vec![
            "Our return policy allows refunds within 30 days of purchase.".to_string(),
            "Standard shipping takes five business days.".to_string(),
            "Gift cards never expire.".to_string(),
        ]
    }

    #[tokio::test]
    async fn ingested_phrase_is_retrieved_first() {
        let (manager, _) = manager_with(CountingEmbedder::default());
        let kb = manager.create_or_get(tenant("acme"), None).await.expect("kb");
        manager.populate(&kb, policy_texts(), "policy.json").await.expect("populate");

        let hits = manager.query(&kb, "what is your return policy for refunds", 3).await.expect("query");

        assert_eq!(hits[0].chunk.text, policy_texts()[0]);
    }

    #[tokio::test]
    async fn reingest_appends_with_dense_indices() {
        let (manager, _) = manager_with(CountingEmbedder::default());
        let kb = manager.create_or_get(tenant("acme"), Some("Acme".to_string())).await.expect("kb");

        manager.populate(&kb, policy_texts(), "v1").await.expect("first ingest");
        let second = manager.populate(&kb, policy_texts(), "v2").await.expect("second ingest");

        assert_eq!(manager.chunk_count(&kb).await.expect("count"), 6);
        assert_eq!(second.iter().map(|chunk| chunk.index).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn blank_texts_are_skipped_during_populate() {
        let (manager, _) = manager_with(CountingEmbedder::default());
        let kb = manager.create_or_get(tenant("acme"), None).await.expect("kb");

        let stored = manager
            .populate(&kb, vec!["  ".to_string(), "Open on Sundays.".to_string()], "hours")
            .await
            .expect("populate");

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].index, 0);
    }

    #[tokio::test]
    async fn empty_store_query_skips_the_embedder() {
        let embedder = CountingEmbedder::default();
        let calls = embedder.calls();
        let (manager, _) = manager_with(embedder);
        let kb = manager.create_or_get(tenant("empty"), None).await.expect("kb");

        let hits = manager.query(&kb, "anything", 10).await.expect("query");

        assert!(hits.is_empty());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_query_is_rejected_before_embedding() {
        let embedder = CountingEmbedder::default();
        let calls = embedder.calls();
        let (manager, _) = manager_with(embedder);
        let kb = manager.create_or_get(tenant("acme"), None).await.expect("kb");
        manager.populate(&kb, policy_texts(), "policy").await.expect("populate");
        let before = calls.load(std::sync::atomic::Ordering::SeqCst);

        let error = manager.query(&kb, "   ", 3).await.expect_err("blank query");

        assert_eq!(error, ApplicationError::Domain(DomainError::MissingInput { field: "query" }));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn query_respects_k_and_orders_by_score() {
        let (manager, _) = manager_with(CountingEmbedder::default());
        let kb = manager.create_or_get(tenant("acme"), None).await.expect("kb");
        manager.populate(&kb, policy_texts(), "policy").await.expect("populate");

        let hits = manager.query(&kb, "shipping refunds gift", 2).await.expect("query");

        assert_eq!(hits.len(), 2);
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[tokio::test]
    async fn concurrent_adds_both_land() {
        let (manager, _) = manager_with(CountingEmbedder::default());
        let manager = Arc::new(manager);
        let kb = manager.create_or_get(tenant("acme"), None).await.expect("kb");
        manager.populate(&kb, policy_texts(), "policy").await.expect("populate");

        let (left, right) = tokio::join!(
            manager.add(&kb, "We price-match competitors.", "ops"),
            manager.add(&kb, "Support is open 24/7.", "ops"),
        );

        let mut indices = vec![left.expect("left").index, right.expect("right").index];
        indices.sort_unstable();
        assert_eq!(indices, vec![3, 4]);
        assert_eq!(manager.chunk_count(&kb).await.expect("count"), 5);
    }

    #[tokio::test]
    async fn unknown_tenant_cannot_be_opened() {
        let (manager, _) = manager_with(CountingEmbedder::default());

        let error = manager.open(&tenant("ghost")).await.expect_err("missing tenant");

        assert_eq!(error, ApplicationError::Domain(DomainError::TenantNotFound("ghost".to_string())));
    }

    #[tokio::test]
    async fn embedding_dimension_mismatch_is_a_provider_error() {
        let (manager, _) = manager_with(CountingEmbedder::with_dimensions(TEST_DIMENSIONS + 1));
        let kb = manager.create_or_get(tenant("acme"), None).await.expect("kb");

        let error = manager.add(&kb, "Hello", "test").await.expect_err("wrong dimensions");

        assert!(matches!(error, ApplicationError::EmbeddingProvider(message) if message.contains("dimensions")));
        assert_eq!(manager.chunk_count(&kb).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn slow_embedder_times_out() {
        let (manager, _) = manager_with(SlowEmbedder(Duration::from_secs(5)));
        let kb = manager.create_or_get(tenant("acme"), None).await.expect("kb");

        let error = manager.add(&kb, "Hello", "test").await.expect_err("timeout");

        assert!(matches!(error, ApplicationError::EmbeddingProvider(message) if message.contains("timed out")));
    }

    #[tokio::test]
    async fn list_and_delete_tenants() {
        let (manager, _) = manager_with(CountingEmbedder::default());
        let acme = manager.create_or_get(tenant("acme"), Some("Acme".to_string())).await.expect("kb");
        manager.create_or_get(tenant("empty"), None).await.expect("kb");
        manager.populate(&acme, policy_texts(), "policy").await.expect("populate");

        let summaries = manager.list().await.expect("list");
        let acme_summary =
            summaries.iter().find(|summary| summary.tenant_id.as_str() == "acme").expect("acme");
        let empty_summary =
            summaries.iter().find(|summary| summary.tenant_id.as_str() == "empty").expect("empty");
        assert_eq!(acme_summary.chunk_count, 3);
        assert_eq!(acme_summary.summary, policy_texts()[0]);
        assert_eq!(empty_summary.summary, EMPTY_KB_SUMMARY);

        manager.delete(&tenant("acme")).await.expect("delete");
        assert!(matches!(
            manager.delete(&tenant("acme")).await,
            Err(ApplicationError::Domain(DomainError::TenantNotFound(_)))
        ));
        assert!(manager.add(&acme, "late write", "test").await.is_err());
        assert_eq!(manager.list().await.expect("list").len(), 1);
    }
}
