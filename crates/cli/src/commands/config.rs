use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use concierge_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct Field {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

fn field(key: &'static str, env_key: &'static str, value: impl ToString) -> Field {
    Field { key, env_key, value: value.to_string() }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in fields(&config) {
        let source = field_source(
            entry.key,
            entry.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(entry.key, &entry.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    vec![
        field("database.url", "CONCIERGE_DATABASE_URL", &config.database.url),
        field(
            "database.max_connections",
            "CONCIERGE_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections,
        ),
        field("database.timeout_secs", "CONCIERGE_DATABASE_TIMEOUT_SECS", config.database.timeout_secs),
        field("llm.backend", "CONCIERGE_LLM_BACKEND", format!("{:?}", config.llm.backend)),
        field("llm.model", "CONCIERGE_LLM_MODEL", &config.llm.model),
        field("llm.base_url", "CONCIERGE_LLM_BASE_URL", config.llm.base_url.as_deref().unwrap_or("<unset>")),
        field(
            "llm.api_key",
            "CONCIERGE_LLM_API_KEY",
            redact_key(config.llm.api_key.as_ref().map(|key| key.expose_secret())),
        ),
        field("llm.timeout_secs", "CONCIERGE_LLM_TIMEOUT_SECS", config.llm.timeout_secs),
        field("llm.max_retries", "CONCIERGE_LLM_MAX_RETRIES", config.llm.max_retries),
        field(
            "embedding.backend",
            "CONCIERGE_EMBEDDING_BACKEND",
            format!("{:?}", config.embedding.backend),
        ),
        field("embedding.model", "CONCIERGE_EMBEDDING_MODEL", &config.embedding.model),
        field(
            "embedding.api_key",
            "CONCIERGE_EMBEDDING_API_KEY",
            redact_key(config.embedding.api_key.as_ref().map(|key| key.expose_secret())),
        ),
        field("embedding.dimensions", "CONCIERGE_EMBEDDING_DIMENSIONS", config.embedding.dimensions),
        field("retrieval.top_k", "CONCIERGE_RETRIEVAL_TOP_K", config.retrieval.top_k),
        field("retrieval.metric", "CONCIERGE_RETRIEVAL_METRIC", format!("{:?}", config.retrieval.metric)),
        field("ingestion.chunk_size", "CONCIERGE_INGESTION_CHUNK_SIZE", config.ingestion.chunk_size),
        field(
            "ingestion.chunk_overlap",
            "CONCIERGE_INGESTION_CHUNK_OVERLAP",
            config.ingestion.chunk_overlap,
        ),
        field("agent.max_steps", "CONCIERGE_AGENT_MAX_STEPS", config.agent.max_steps),
        field(
            "agent.escalation_sentinel",
            "CONCIERGE_AGENT_ESCALATION_SENTINEL",
            &config.agent.escalation_sentinel,
        ),
        field("agent.handoff_poll_ms", "CONCIERGE_AGENT_HANDOFF_POLL_MS", config.agent.handoff_poll_ms),
        field("server.bind_address", "CONCIERGE_SERVER_BIND_ADDRESS", &config.server.bind_address),
        field("server.port", "CONCIERGE_SERVER_PORT", config.server.port),
        field("logging.level", "CONCIERGE_LOGGING_LEVEL", &config.logging.level),
        field("logging.format", "CONCIERGE_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a short prefix (`sk-***`) so operators can tell keys apart.
fn redact_key(key: Option<&str>) -> String {
    let Some(key) = key.map(str::trim) else {
        return "<unset>".to_string();
    };
    if key.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = key.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_key};

    #[test]
    fn redaction_never_prints_the_secret_tail() {
        assert_eq!(redact_key(Some("sk-live-abcdef")), "sk-***");
        assert_eq!(redact_key(Some("abcdef")), "<redacted>");
        assert_eq!(redact_key(Some("  ")), "<empty>");
        assert_eq!(redact_key(None), "<unset>");
    }

    #[test]
    fn dotted_paths_resolve_into_nested_tables() {
        let doc = "[agent]\nmax_steps = 6\n".parse::<Value>().expect("toml");

        assert!(contains_path(&doc, "agent.max_steps"));
        assert!(!contains_path(&doc, "agent.escalation_sentinel"));
    }
}
