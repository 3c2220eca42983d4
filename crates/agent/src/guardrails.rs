/// Outcome of checking a generated answer against the escalation sentinel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationDecision {
    Deliver { text: String },
    Escalate,
}

/// Configurable substring check that decides when a human takes over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationPolicy {
    sentinel: String,
}

impl EscalationPolicy {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self { sentinel: sentinel.into() }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    pub fn requires_human(&self, text: &str) -> bool {
        !self.sentinel.is_empty() && text.contains(&self.sentinel)
    }

    /// Removes the sentinel and any wrapping code fences from model output.
    pub fn clean(&self, text: &str) -> String {
        let without_sentinel = if self.sentinel.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.sentinel, "")
        };
        strip_code_fences(&without_sentinel)
    }

    pub fn evaluate(&self, text: &str) -> EscalationDecision {
        if self.requires_human(text) {
            return EscalationDecision::Escalate;
        }
        EscalationDecision::Deliver { text: self.clean(text) }
    }
}

/// Strips surrounding Markdown fences (with an optional language tag) or a
/// single pair of backticks.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(inner) =
        trimmed.strip_prefix("```").and_then(|rest| rest.strip_suffix("```")).filter(|_| trimmed.len() >= 6)
    {
        let body = match inner.split_once('\n') {
            Some((tag, rest)) if tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => rest,
            _ => inner,
        };
        return body.trim().to_string();
    }

    if let Some(inner) = trimmed
        .strip_prefix('`')
        .and_then(|rest| rest.strip_suffix('`'))
        .filter(|inner| !inner.contains('`'))
    {
        return inner.trim().to_string();
    }

    trimmed.strip_suffix("```").unwrap_or(trimmed).trim().to_string()
}
