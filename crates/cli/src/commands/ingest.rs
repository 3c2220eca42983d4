use std::fs;
use std::path::Path;

use concierge_core::domain::tenant::TenantId;
use concierge_core::ingest::RawInput;

use crate::commands::{with_context, CommandResult};

pub fn run(tenant: Option<String>, name: Option<String>, file: &Path) -> CommandResult {
    let input = match read_input(file) {
        Ok(input) => input,
        Err(failure) => return failure,
    };
    let tenant_id = match tenant.map(TenantId::parse).transpose() {
        Ok(tenant_id) => tenant_id,
        Err(error) => return CommandResult::failure("ingest", "invalid_input", error.to_string(), 8),
    };
    let source_ref = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string());

    let result = with_context("ingest", |context| async move {
        context.ingest(tenant_id, name, input, &source_ref).await
    });

    match result {
        Ok(report) => CommandResult::success_with(
            "ingest",
            format!("stored {} chunk(s) for tenant {}", report.chunk_count, report.tenant_id),
            Some(report),
        ),
        Err(failure) => failure,
    }
}

/// `.json` files are parsed as documents; anything else is plain text.
fn read_input(file: &Path) -> Result<RawInput, CommandResult> {
    let raw = fs::read_to_string(file).map_err(|error| {
        CommandResult::failure(
            "ingest",
            "io",
            format!("could not read `{}`: {error}", file.display()),
            10,
        )
    })?;

    let is_json = file
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    if !is_json {
        return Ok(RawInput::Text(raw));
    }

    serde_json::from_str(&raw).map(RawInput::from_payload).map_err(|error| {
        CommandResult::failure(
            "ingest",
            "invalid_input",
            format!("`{}` is not valid JSON: {error}", file.display()),
            8,
        )
    })
}
