//! Conversation engine for tenant knowledge bases.
//!
//! - `knowledge` owns tenant stores: embedding, append and similarity query.
//! - `tools` exposes retrieval, answer generation and KB updates as a closed
//!   capability set dispatched by name.
//! - `runtime` drives one bounded turn and decides answer, handoff or failure.
//! - `conversation` runs a session task per connection; `handoff` holds the
//!   human escalation queue.
//! - `context` wires all of it once at startup.
//!
//! The model only phrases answers. Escalation is detected from the configured
//! sentinel, never from free-form judgement in this crate.

pub mod context;
pub mod conversation;
pub mod guardrails;
pub mod handoff;
pub mod knowledge;
pub mod llm;
pub mod runtime;
pub mod tools;

#[cfg(test)]
mod testing;

pub use context::{AgentContext, IngestReport, Providers, Stores};
pub use conversation::{
    open_session, InboundMessage, OutboundMessage, SessionError, SessionHandle, SessionRegistry,
};
pub use handoff::HandoffQueue;
pub use knowledge::{KnowledgeBase, KnowledgeBaseManager};
pub use runtime::{AgentRuntime, TurnOutcome, TurnReport};
