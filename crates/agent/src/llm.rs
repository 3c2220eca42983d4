//! Embedding and generation providers.
//!
//! The engine never talks to a model directly; it goes through
//! [`EmbeddingProvider`] and [`GenerationProvider`]. HTTP clients cover
//! OpenAI-compatible endpoints and Ollama. [`HashingEmbedder`] is an offline,
//! deterministic embedder for local runs and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use concierge_core::config::{EmbeddingBackend, EmbeddingConfig, LlmBackend, LlmConfig};

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_BASE_URL: &str = "http://localhost:11434";
const ERROR_BODY_PREVIEW_CHARS: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimensions { expected: usize, actual: usize },
    #[error("provider misconfigured: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

pub fn embedding_provider_from_config(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.backend {
        EmbeddingBackend::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dimensions))),
        EmbeddingBackend::OpenAi => Ok(Arc::new(OpenAiClient::new(
            config.base_url.as_deref().unwrap_or(OPENAI_DEFAULT_BASE_URL),
            config.api_key.clone(),
            &config.model,
            timeout,
        )?)),
        EmbeddingBackend::Ollama => Ok(Arc::new(OllamaClient::new(
            config.base_url.as_deref().unwrap_or(OLLAMA_DEFAULT_BASE_URL),
            &config.model,
            timeout,
        )?)),
    }
}

pub fn generation_provider_from_config(
    config: &LlmConfig,
) -> Result<Arc<dyn GenerationProvider>, ProviderError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.backend {
        LlmBackend::OpenAi => Ok(Arc::new(OpenAiClient::new(
            config.base_url.as_deref().unwrap_or(OPENAI_DEFAULT_BASE_URL),
            config.api_key.clone(),
            &config.model,
            timeout,
        )?)),
        LlmBackend::Ollama => Ok(Arc::new(OllamaClient::new(
            config.base_url.as_deref().unwrap_or(OLLAMA_DEFAULT_BASE_URL),
            &config.model,
            timeout,
        )?)),
    }
}

fn http_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|error| ProviderError::Configuration(format!("http client: {error}")))
}

fn request_error(error: reqwest::Error, timeout: Duration) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Request(error.to_string())
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    timeout: Duration,
) -> Result<T, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Status {
            status: status.as_u16(),
            body: body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
        });
    }
    response.json::<T>().await.map_err(|error| {
        if error.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::Decode(error.to_string())
        }
    })
}

/// Chat-completions and embeddings client for OpenAI-compatible APIs.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            timeout,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}/{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingList {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl GenerationProvider for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let response = self
            .post("chat/completions")
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
            }))
            .send()
            .await
            .map_err(|error| request_error(error, self.timeout))?;

        let completion: ChatCompletion = read_json(response, self.timeout).await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| ProviderError::Decode("completion has no choices".to_string()))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let response = self
            .post("embeddings")
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|error| request_error(error, self.timeout))?;

        let list: EmbeddingList = read_json(response, self.timeout).await?;
        list.data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| ProviderError::Decode("embedding response is empty".to_string()))
    }
}

pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
        })
    }
}

#[derive(Deserialize)]
struct OllamaGeneration {
    response: String,
}

#[derive(Deserialize)]
struct OllamaEmbedding {
    embedding: Vec<f32>,
}

#[async_trait]
impl GenerationProvider for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({ "model": self.model, "prompt": prompt, "stream": false }))
            .send()
            .await
            .map_err(|error| request_error(error, self.timeout))?;

        let generation: OllamaGeneration = read_json(response, self.timeout).await?;
        Ok(generation.response)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|error| request_error(error, self.timeout))?;

        let embedding: OllamaEmbedding = read_json(response, self.timeout).await?;
        Ok(embedding.embedding)
    }
}

/// Feature-hashing bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed with blake3 into one of
/// `dimensions` buckets with a hash-derived sign, and the result is L2
/// normalised. Texts sharing vocabulary land close under cosine similarity.
#[derive(Clone, Debug)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase)
        {
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|value| *value /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use concierge_core::search::{score, SimilarityMetric};

    use super::{EmbeddingProvider, HashingEmbedder};

    #[tokio::test]
    async fn hashing_embedder_is_deterministic_and_normalised() {
        let embedder = HashingEmbedder::new(64);

        let first = embedder.embed("Returns within 30 days").await.expect("embed");
        let second = embedder.embed("returns WITHIN 30 days!").await.expect("embed");

        assert_eq!(first.len(), 64);
        assert_eq!(first, second);
        let norm = first.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::new(256);
        let query = embedder.embed_sync("what is the return policy");
        let related = embedder.embed_sync("Our return policy allows refunds within 30 days.");
        let unrelated = embedder.embed_sync("Shipping to Canada takes a week.");

        assert!(
            score(SimilarityMetric::Cosine, &query, &related)
                > score(SimilarityMetric::Cosine, &query, &unrelated)
        );
    }

    #[test]
    fn text_without_tokens_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        assert_eq!(embedder.embed_sync("  ... "), vec![0.0; 8]);
    }
}
