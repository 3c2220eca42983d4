pub mod config;
pub mod handoffs;
pub mod ingest;
pub mod migrate;
pub mod search;

use std::future::Future;
use std::sync::Arc;

use concierge_agent::AgentContext;
use concierge_core::config::{AppConfig, LoadOptions};
use concierge_core::errors::{ApplicationError, DomainError};
use concierge_db::{connect_with_settings, migrations};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with(command, message, None::<()>)
    }

    /// Success payload carrying a structured `data` field.
    pub fn success_with(
        command: &str,
        message: impl Into<String>,
        data: Option<impl Serialize>,
    ) -> Self {
        let data = match data.map(serde_json::to_value).transpose() {
            Ok(data) => data,
            Err(error) => {
                return Self::failure(command, "serialization", error.to_string(), 1);
            }
        };
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    fn from_application_error(command: &str, error: ApplicationError) -> Self {
        let (error_class, exit_code) = match &error {
            ApplicationError::Domain(
                DomainError::TenantNotFound(_) | DomainError::UnknownRequest(_),
            ) => ("not_found", 7),
            ApplicationError::Domain(_) => ("invalid_input", 8),
            ApplicationError::EmbeddingProvider(_) | ApplicationError::GenerationFailure(_) => {
                ("provider", 9)
            }
            ApplicationError::Persistence(_) => ("persistence", 4),
            ApplicationError::Configuration(_) => ("config_validation", 2),
        };
        Self::failure(command, error_class, error.to_string(), exit_code)
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(command, "config_validation", format!("configuration issue: {error}"), 2)
    })
}

pub(crate) fn build_runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

/// Connects, applies pending migrations and runs `work` against a fresh
/// agent context. The pool is closed before returning.
pub(crate) fn with_context<T, F, Fut>(command: &str, work: F) -> Result<T, CommandResult>
where
    F: FnOnce(Arc<AgentContext>) -> Fut,
    Fut: Future<Output = Result<T, ApplicationError>>,
{
    let config = load_config(command)?;
    let runtime = build_runtime(command)?;

    runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| CommandResult::failure(command, "db_connectivity", error.to_string(), 4))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| CommandResult::failure(command, "migration", error.to_string(), 5))?;

        let context = match AgentContext::from_pool(config, pool.clone()) {
            Ok(context) => Arc::new(context),
            Err(error) => {
                pool.close().await;
                return Err(CommandResult::from_application_error(command, error));
            }
        };

        let outcome = work(context).await;
        pool.close().await;
        outcome.map_err(|error| CommandResult::from_application_error(command, error))
    })
}
