use concierge_core::domain::tenant::TenantId;
use serde::Serialize;

use crate::commands::{with_context, CommandResult};

#[derive(Debug, Serialize)]
struct SearchRow {
    index: u64,
    score: f32,
    source_ref: String,
    text: String,
}

pub fn run(tenant: &str, query: &str, k: usize) -> CommandResult {
    let tenant_id = match TenantId::parse(tenant) {
        Ok(tenant_id) => tenant_id,
        Err(error) => return CommandResult::failure("search", "invalid_input", error.to_string(), 8),
    };
    let query = query.to_string();

    let result = with_context("search", |context| async move {
        let knowledge = context.knowledge();
        let kb = knowledge.open(&tenant_id).await?;
        let hits = knowledge.query(&kb, &query, k).await?;
        Ok(hits
            .into_iter()
            .map(|hit| SearchRow {
                index: hit.chunk.index,
                score: hit.score,
                source_ref: hit.chunk.source_ref,
                text: hit.chunk.text,
            })
            .collect::<Vec<_>>())
    });

    match result {
        Ok(rows) => {
            CommandResult::success_with("search", format!("{} hit(s)", rows.len()), Some(rows))
        }
        Err(failure) => failure,
    }
}
