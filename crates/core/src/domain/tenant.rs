use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

const MAX_TENANT_ID_LEN: usize = 128;
const SUMMARY_MAX_CHARS: usize = 150;
pub const EMPTY_KB_SUMMARY: &str = "(KB is empty)";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::MissingInput { field: "tenant_id" });
        }
        if trimmed.len() > MAX_TENANT_ID_LEN {
            return Err(DomainError::MalformedInput(format!(
                "tenant id exceeds {MAX_TENANT_ID_LEN} bytes"
            )));
        }
        if trimmed.chars().any(|c| c.is_control() || c == '/') {
            return Err(DomainError::MalformedInput(
                "tenant id must not contain control characters or `/`".to_owned(),
            ));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: TenantId, name: Option<String>) -> Self {
        let name = name.map(|name| name.trim().to_owned()).filter(|name| !name.is_empty());
        Self { id, name, created_at: Utc::now() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSummary {
    pub tenant_id: TenantId,
    pub name: Option<String>,
    pub chunk_count: usize,
    pub summary: String,
}

impl TenantSummary {
    pub fn new(tenant: &Tenant, chunk_count: usize, first_chunk: Option<&str>) -> Self {
        Self {
            tenant_id: tenant.id.clone(),
            name: tenant.name.clone(),
            chunk_count,
            summary: summarize(first_chunk),
        }
    }
}

/// Preview of a knowledge base derived from its first chunk.
pub fn summarize(first_chunk: Option<&str>) -> String {
    match first_chunk {
        Some(text) if text.chars().count() > SUMMARY_MAX_CHARS => {
            let mut preview = text.chars().take(SUMMARY_MAX_CHARS).collect::<String>();
            preview.push_str("...");
            preview
        }
        Some(text) if !text.is_empty() => text.to_owned(),
        _ => EMPTY_KB_SUMMARY.to_owned(),
    }
}
