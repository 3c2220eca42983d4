use concierge_core::domain::handoff::HandoffRequestId;

use crate::commands::{with_context, CommandResult};

pub fn list() -> CommandResult {
    let result =
        with_context("handoffs", |context| async move { context.handoffs().pending().await });

    match result {
        Ok(pending) => CommandResult::success_with(
            "handoffs",
            format!("{} pending request(s)", pending.len()),
            Some(pending),
        ),
        Err(failure) => failure,
    }
}

/// The reply is persisted (and optionally added to the knowledge base). A
/// server session waiting on the request finds it on its next storage check,
/// every `agent.handoff_poll_ms`.
pub fn resolve(request_id: &str, response_text: &str, update_kb: bool) -> CommandResult {
    let request_id = HandoffRequestId(request_id.trim().to_string());
    let response_text = response_text.to_string();

    let result = with_context("resolve", |context| async move {
        context.handoffs().resolve(&request_id, &response_text, update_kb).await
    });

    match result {
        Ok(request) => CommandResult::success_with(
            "resolve",
            format!("resolved {}", request.request_id),
            Some(request),
        ),
        Err(failure) => failure,
    }
}
