use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::search::SimilarityMetric;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub ingestion: IngestionConfig,
    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub metric: SimilarityMetric,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IngestionConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: u32,
    pub retry_base_delay_ms: u64,
    pub escalation_sentinel: String,
    pub session_queue_capacity: usize,
    /// How often a session awaiting a human rechecks its request in storage,
    /// so resolutions made by another process still reach it.
    pub handoff_poll_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    OpenAi,
    Ollama,
    Hashing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_backend: Option<LlmBackend>,
    pub llm_model: Option<String>,
    pub embedding_backend: Option<EmbeddingBackend>,
    pub embedding_dimensions: Option<usize>,
    pub escalation_sentinel: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://concierge.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                backend: LlmBackend::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
            },
            embedding: EmbeddingConfig {
                backend: EmbeddingBackend::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "nomic-embed-text".to_string(),
                dimensions: 768,
                timeout_secs: 15,
            },
            retrieval: RetrievalConfig { top_k: 10, metric: SimilarityMetric::Cosine },
            ingestion: IngestionConfig { chunk_size: 1000, chunk_overlap: 150 },
            agent: AgentConfig {
                max_steps: 4,
                retry_base_delay_ms: 200,
                escalation_sentinel: "(needs help)".to_string(),
                session_queue_capacity: 64,
                handoff_poll_ms: 2_000,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm backend `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for EmbeddingBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "hashing" => Ok(Self::Hashing),
            other => Err(ConfigError::Validation(format!(
                "unsupported embedding backend `{other}` (expected openai|ollama|hashing)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("concierge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(backend) = llm.backend {
                self.llm.backend = backend;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(embedding) = patch.embedding {
            if let Some(backend) = embedding.backend {
                self.embedding.backend = backend;
            }
            if let Some(embedding_api_key_value) = embedding.api_key {
                self.embedding.api_key = Some(secret_value(embedding_api_key_value));
            }
            if let Some(base_url) = embedding.base_url {
                self.embedding.base_url = Some(base_url);
            }
            if let Some(model) = embedding.model {
                self.embedding.model = model;
            }
            if let Some(dimensions) = embedding.dimensions {
                self.embedding.dimensions = dimensions;
            }
            if let Some(timeout_secs) = embedding.timeout_secs {
                self.embedding.timeout_secs = timeout_secs;
            }
        }

        if let Some(retrieval) = patch.retrieval {
            if let Some(top_k) = retrieval.top_k {
                self.retrieval.top_k = top_k;
            }
            if let Some(metric) = retrieval.metric {
                self.retrieval.metric = metric;
            }
        }

        if let Some(ingestion) = patch.ingestion {
            if let Some(chunk_size) = ingestion.chunk_size {
                self.ingestion.chunk_size = chunk_size;
            }
            if let Some(chunk_overlap) = ingestion.chunk_overlap {
                self.ingestion.chunk_overlap = chunk_overlap;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(max_steps) = agent.max_steps {
                self.agent.max_steps = max_steps;
            }
            if let Some(retry_base_delay_ms) = agent.retry_base_delay_ms {
                self.agent.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(escalation_sentinel) = agent.escalation_sentinel {
                self.agent.escalation_sentinel = escalation_sentinel;
            }
            if let Some(session_queue_capacity) = agent.session_queue_capacity {
                self.agent.session_queue_capacity = session_queue_capacity;
            }
            if let Some(handoff_poll_ms) = agent.handoff_poll_ms {
                self.agent.handoff_poll_ms = handoff_poll_ms;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CONCIERGE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_value("CONCIERGE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_value("CONCIERGE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_LLM_BACKEND") {
            self.llm.backend = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_value("CONCIERGE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_value("CONCIERGE_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_EMBEDDING_BACKEND") {
            self.embedding.backend = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_EMBEDDING_BASE_URL") {
            self.embedding.base_url = Some(value);
        }
        if let Some(value) = read_env("CONCIERGE_EMBEDDING_MODEL") {
            self.embedding.model = value;
        }
        if let Some(value) = read_env("CONCIERGE_EMBEDDING_DIMENSIONS") {
            self.embedding.dimensions = parse_value("CONCIERGE_EMBEDDING_DIMENSIONS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_EMBEDDING_TIMEOUT_SECS") {
            self.embedding.timeout_secs =
                parse_value("CONCIERGE_EMBEDDING_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_RETRIEVAL_TOP_K") {
            self.retrieval.top_k = parse_value("CONCIERGE_RETRIEVAL_TOP_K", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_RETRIEVAL_METRIC") {
            self.retrieval.metric = value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
                key: "CONCIERGE_RETRIEVAL_METRIC".to_string(),
                value: value.clone(),
            })?;
        }

        if let Some(value) = read_env("CONCIERGE_INGESTION_CHUNK_SIZE") {
            self.ingestion.chunk_size = parse_value("CONCIERGE_INGESTION_CHUNK_SIZE", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_INGESTION_CHUNK_OVERLAP") {
            self.ingestion.chunk_overlap =
                parse_value("CONCIERGE_INGESTION_CHUNK_OVERLAP", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_AGENT_MAX_STEPS") {
            self.agent.max_steps = parse_value("CONCIERGE_AGENT_MAX_STEPS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_RETRY_BASE_DELAY_MS") {
            self.agent.retry_base_delay_ms =
                parse_value("CONCIERGE_AGENT_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_ESCALATION_SENTINEL") {
            self.agent.escalation_sentinel = value;
        }
        if let Some(value) = read_env("CONCIERGE_AGENT_HANDOFF_POLL_MS") {
            self.agent.handoff_poll_ms = parse_value("CONCIERGE_AGENT_HANDOFF_POLL_MS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_PORT") {
            self.server.port = parse_value("CONCIERGE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_value("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("CONCIERGE_LOGGING_LEVEL").or_else(|| read_env("CONCIERGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONCIERGE_LOGGING_FORMAT").or_else(|| read_env("CONCIERGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_backend) = overrides.llm_backend {
            self.llm.backend = llm_backend;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(embedding_backend) = overrides.embedding_backend {
            self.embedding.backend = embedding_backend;
        }
        if let Some(embedding_dimensions) = overrides.embedding_dimensions {
            self.embedding.dimensions = embedding_dimensions;
        }
        if let Some(escalation_sentinel) = overrides.escalation_sentinel {
            self.agent.escalation_sentinel = escalation_sentinel;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_embedding(&self.embedding)?;
        validate_retrieval(&self.retrieval)?;
        validate_ingestion(&self.ingestion)?;
        validate_agent(&self.agent)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.backend {
        LlmBackend::OpenAi => {
            if secret_missing(llm.api_key.as_ref()) {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai backend".to_string(),
                ));
            }
        }
        LlmBackend::Ollama => {
            if url_missing(llm.base_url.as_deref()) {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for the ollama backend".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_embedding(embedding: &EmbeddingConfig) -> Result<(), ConfigError> {
    if embedding.timeout_secs == 0 || embedding.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "embedding.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if embedding.dimensions == 0 || embedding.dimensions > 8192 {
        return Err(ConfigError::Validation(
            "embedding.dimensions must be in range 1..=8192".to_string(),
        ));
    }

    match embedding.backend {
        EmbeddingBackend::OpenAi => {
            if secret_missing(embedding.api_key.as_ref()) {
                return Err(ConfigError::Validation(
                    "embedding.api_key is required for the openai backend".to_string(),
                ));
            }
        }
        EmbeddingBackend::Ollama => {
            if url_missing(embedding.base_url.as_deref()) {
                return Err(ConfigError::Validation(
                    "embedding.base_url is required for the ollama backend".to_string(),
                ));
            }
        }
        EmbeddingBackend::Hashing => {}
    }

    Ok(())
}

fn validate_retrieval(retrieval: &RetrievalConfig) -> Result<(), ConfigError> {
    if retrieval.top_k == 0 || retrieval.top_k > 100 {
        return Err(ConfigError::Validation(
            "retrieval.top_k must be in range 1..=100".to_string(),
        ));
    }
    Ok(())
}

fn validate_ingestion(ingestion: &IngestionConfig) -> Result<(), ConfigError> {
    if ingestion.chunk_size == 0 {
        return Err(ConfigError::Validation(
            "ingestion.chunk_size must be greater than zero".to_string(),
        ));
    }

    if ingestion.chunk_overlap >= ingestion.chunk_size {
        return Err(ConfigError::Validation(format!(
            "ingestion.chunk_overlap ({}) must be smaller than ingestion.chunk_size ({})",
            ingestion.chunk_overlap, ingestion.chunk_size
        )));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_steps < 2 || agent.max_steps > 16 {
        return Err(ConfigError::Validation(
            "agent.max_steps must be in range 2..=16 (one retrieval plus at least one generation)"
                .to_string(),
        ));
    }

    if agent.escalation_sentinel.trim().is_empty() {
        return Err(ConfigError::Validation(
            "agent.escalation_sentinel must not be blank".to_string(),
        ));
    }

    if agent.session_queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "agent.session_queue_capacity must be greater than zero".to_string(),
        ));
    }

    if agent.handoff_poll_ms == 0 {
        return Err(ConfigError::Validation(
            "agent.handoff_poll_ms must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn secret_missing(secret: Option<&SecretString>) -> bool {
    secret.map(|value| value.expose_secret().trim().is_empty()).unwrap_or(true)
}

fn url_missing(url: Option<&str>) -> bool {
    url.map(|value| value.trim().is_empty()).unwrap_or(true)
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    embedding: Option<EmbeddingPatch>,
    retrieval: Option<RetrievalPatch>,
    ingestion: Option<IngestionPatch>,
    agent: Option<AgentPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    backend: Option<LlmBackend>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingPatch {
    backend: Option<EmbeddingBackend>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    dimensions: Option<usize>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalPatch {
    top_k: Option<usize>,
    metric: Option<SimilarityMetric>,
}

#[derive(Debug, Default, Deserialize)]
struct IngestionPatch {
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_steps: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    escalation_sentinel: Option<String>,
    session_queue_capacity: Option<usize>,
    handoff_poll_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, EmbeddingBackend, LlmBackend, LoadOptions,
        LogFormat,
    };
    use crate::search::SimilarityMetric;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_and_use_documented_open_question_choices() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.agent.escalation_sentinel == "(needs help)", "default sentinel")?;
        ensure(config.retrieval.metric == SimilarityMetric::Cosine, "default metric is cosine")?;
        ensure(config.ingestion.chunk_size == 1000, "default chunk size")?;
        ensure(config.ingestion.chunk_overlap == 150, "default chunk overlap")?;
        ensure(config.retrieval.top_k == 10, "default top_k")?;
        ensure(config.agent.handoff_poll_ms == 2_000, "default handoff poll interval")?;
        Ok(())
    }

    #[test]
    fn zero_handoff_poll_interval_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_AGENT_HANDOFF_POLL_MS", "0");
        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected validation failure for a zero poll interval".to_string()),
            Err(ConfigError::Validation(message)) => {
                ensure(message.contains("agent.handoff_poll_ms"), "message names the field")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_vars(&["CONCIERGE_AGENT_HANDOFF_POLL_MS"]);
        result
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CONCIERGE_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[llm]
backend = "open_ai"
api_key = "${TEST_CONCIERGE_LLM_KEY}"
model = "gpt-4o-mini"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.backend == LlmBackend::OpenAi, "backend should come from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_CONCIERGE_LLM_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LOG_LEVEL", "warn");
        env::set_var("CONCIERGE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["CONCIERGE_LOG_LEVEL", "CONCIERGE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CONCIERGE_INGESTION_CHUNK_SIZE", "400");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[ingestion]
chunk_size = 200
chunk_overlap = 20

[embedding]
backend = "hashing"
dimensions = 64

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.ingestion.chunk_size == 400, "env chunk size should win over file")?;
            ensure(config.ingestion.chunk_overlap == 20, "file overlap should win over default")?;
            ensure(
                config.embedding.backend == EmbeddingBackend::Hashing,
                "embedding backend should come from file",
            )?;
            ensure(config.embedding.dimensions == 64, "dimensions should come from file")?;
            Ok(())
        })();

        clear_vars(&["CONCIERGE_DATABASE_URL", "CONCIERGE_INGESTION_CHUNK_SIZE"]);
        result
    }

    #[test]
    fn validation_rejects_overlap_not_smaller_than_chunk_size() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_INGESTION_CHUNK_SIZE", "100");
        env::set_var("CONCIERGE_INGESTION_CHUNK_OVERLAP", "100");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("ingestion.chunk_overlap")
            );
            ensure(has_message, "validation failure should mention ingestion.chunk_overlap")
        })();

        clear_vars(&["CONCIERGE_INGESTION_CHUNK_SIZE", "CONCIERGE_INGESTION_CHUNK_OVERLAP"]);
        result
    }

    #[test]
    fn openai_backend_requires_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LLM_BACKEND", "openai");

        let result = (|| -> Result<(), String> {
            match AppConfig::load(LoadOptions::default()) {
                Ok(_) => Err("expected validation failure for missing api key".to_string()),
                Err(ConfigError::Validation(message)) => {
                    ensure(message.contains("llm.api_key"), "message should name llm.api_key")
                }
                Err(other) => Err(format!("unexpected error: {other}")),
            }
        })();

        clear_vars(&["CONCIERGE_LLM_BACKEND"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_RETRIEVAL_TOP_K", "lots");

        let result = (|| -> Result<(), String> {
            match AppConfig::load(LoadOptions::default()) {
                Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                    ensure(key == "CONCIERGE_RETRIEVAL_TOP_K", "key should be reported")
                }
                Ok(_) => Err("expected invalid override error".to_string()),
                Err(other) => Err(format!("unexpected error: {other}")),
            }
        })();

        clear_vars(&["CONCIERGE_RETRIEVAL_TOP_K"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LLM_BACKEND", "openai");
        env::set_var("CONCIERGE_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["CONCIERGE_LLM_BACKEND", "CONCIERGE_LLM_API_KEY"]);
        result
    }
}
