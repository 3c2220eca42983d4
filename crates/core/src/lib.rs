pub mod config;
pub mod domain;
pub mod errors;
pub mod ingest;
pub mod search;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use domain::chunk::{Chunk, ScoredChunk};
pub use domain::handoff::{HandoffRequest, HandoffRequestId, HandoffStatus};
pub use domain::session::{HistoryEntry, Role, Session, SessionId, SessionState};
pub use domain::tenant::{Tenant, TenantId, TenantSummary};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ingest::{IngestionPipeline, RawInput};
pub use search::{ExactSearch, SearchHit, SimilarityMetric, VectorSearch};
