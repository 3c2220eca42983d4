use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use concierge_core::config::{AppConfig, EmbeddingBackend};
use concierge_core::search::ExactSearch;
use concierge_db::repositories::{
    InMemoryChunkRepository, InMemoryHandoffRepository, InMemoryTenantRepository,
};

use crate::context::{AgentContext, Providers, Stores};
use crate::knowledge::KnowledgeBaseManager;
use crate::llm::{EmbeddingProvider, GenerationProvider, HashingEmbedder, ProviderError};

pub(crate) const TEST_DIMENSIONS: usize = 256;

pub(crate) struct TestStores {
    pub handoffs: Arc<InMemoryHandoffRepository>,
}

pub(crate) fn manager_with(
    embedder: impl EmbeddingProvider + 'static,
) -> (KnowledgeBaseManager, TestStores) {
    let manager = KnowledgeBaseManager::new(
        Arc::new(InMemoryTenantRepository::default()),
        Arc::new(InMemoryChunkRepository::default()),
        Arc::new(embedder),
        Arc::new(ExactSearch::default()),
        TEST_DIMENSIONS,
        Duration::from_millis(200),
    );
    (manager, TestStores { handoffs: Arc::new(InMemoryHandoffRepository::default()) })
}

/// In-memory context with hashing embeddings, no retries and short timeouts.
pub(crate) fn test_context(generator: ScriptedGenerator) -> AgentContext {
    test_context_with(generator, Stores::in_memory())
}

pub(crate) fn test_context_with(generator: ScriptedGenerator, stores: Stores) -> AgentContext {
    let mut config = AppConfig::default();
    config.embedding.backend = EmbeddingBackend::Hashing;
    config.embedding.dimensions = TEST_DIMENSIONS;
    config.llm.max_retries = 0;
    config.agent.retry_base_delay_ms = 1;
    config.agent.handoff_poll_ms = 20;

    let providers = Providers {
        embedder: Arc::new(CountingEmbedder::default()),
        generator: Arc::new(generator),
        embed_timeout: Duration::from_millis(200),
        generate_timeout: Duration::from_millis(200),
    };
    AgentContext::assemble(config, stores, providers).expect("test context")
}

pub(crate) struct CountingEmbedder {
    inner: HashingEmbedder,
    calls: Arc<AtomicUsize>,
}

impl Default for CountingEmbedder {
    fn default() -> Self {
        Self::with_dimensions(TEST_DIMENSIONS)
    }
}

impl CountingEmbedder {
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self { inner: HashingEmbedder::new(dimensions), calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(text).await
    }
}

pub(crate) struct SlowEmbedder(pub Duration);

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        tokio::time::sleep(self.0).await;
        Ok(vec![0.0; TEST_DIMENSIONS])
    }
}

/// Replays canned responses in order; repeats the last one when exhausted.
pub(crate) struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    last: Mutex<Option<Result<String, ProviderError>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
            prompts: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    pub fn answering<const N: usize>(responses: [&str; N]) -> Self {
        Self::new(responses.iter().map(|text| Ok(text.to_string())).collect())
    }

    pub fn failing(times: usize) -> Self {
        Self::new(
            (0..times).map(|_| Err(ProviderError::Request("connection refused".to_string()))).collect(),
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
        self.prompts.clone()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        self.prompts.lock().expect("prompts lock").push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.responses.lock().expect("responses lock").pop_front();
        let mut last = self.last.lock().expect("last lock");
        match next {
            Some(response) => {
                *last = Some(response.clone());
                response
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(ProviderError::Request("no scripted response".to_string()))),
        }
    }
}
