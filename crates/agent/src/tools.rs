//! The closed capability set the orchestrator chooses from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tera::{Context, Tera};
use tracing::warn;

use concierge_core::domain::chunk::{Chunk, ScoredChunk};
use concierge_core::errors::{ApplicationError, DomainError};

use crate::guardrails::EscalationPolicy;
use crate::knowledge::{KnowledgeBase, KnowledgeBaseManager};
use crate::llm::{GenerationProvider, ProviderError};

pub const NO_RELEVANT_INFORMATION: &str = "No relevant information found in the knowledge base.";

const ANSWER_TEMPLATE_NAME: &str = "answer_prompt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Retrieve,
    Generate,
    UpdateKnowledge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CapabilityDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: CapabilityKind,
}

pub const CAPABILITIES: [CapabilityDescriptor; 3] = [
    CapabilityDescriptor {
        name: "knowledge_base_retriever",
        description: "Search the tenant knowledge base for passages relevant to a query.",
        kind: CapabilityKind::Retrieve,
    },
    CapabilityDescriptor {
        name: "answer_generator",
        description: "Generate an answer to a question from retrieved context.",
        kind: CapabilityKind::Generate,
    },
    CapabilityDescriptor {
        name: "update_knowledge_base",
        description: "Add a new passage to the tenant knowledge base.",
        kind: CapabilityKind::UpdateKnowledge,
    },
];

impl CapabilityKind {
    pub fn descriptor(self) -> CapabilityDescriptor {
        match self {
            Self::Retrieve => CAPABILITIES[0],
            Self::Generate => CAPABILITIES[1],
            Self::UpdateKnowledge => CAPABILITIES[2],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapabilityInput {
    Retrieve { query: String },
    Generate { context: String, question: String },
    UpdateKnowledge { text: String, source_ref: String },
}

impl CapabilityInput {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Retrieve { .. } => CapabilityKind::Retrieve,
            Self::Generate { .. } => CapabilityKind::Generate,
            Self::UpdateKnowledge { .. } => CapabilityKind::UpdateKnowledge,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CapabilityOutput {
    Retrieved(RetrievedContext),
    Generated(GeneratedAnswer),
    KnowledgeUpdated(Chunk),
}

/// Prompt-ready passages and the best similarity among them.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievedContext {
    pub formatted: String,
    pub top_score: Option<f32>,
}

/// Raw model text plus the structured escalation flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedAnswer {
    pub text: String,
    pub escalate: bool,
}

pub struct RetrievalCapability {
    knowledge: Arc<KnowledgeBaseManager>,
    top_k: usize,
}

impl RetrievalCapability {
    pub fn new(knowledge: Arc<KnowledgeBaseManager>, top_k: usize) -> Self {
        Self { knowledge, top_k }
    }

    pub async fn retrieve(
        &self,
        kb: &KnowledgeBase,
        query: &str,
    ) -> Result<RetrievedContext, ApplicationError> {
        let hits = self.knowledge.query(kb, query, self.top_k).await?;
        Ok(RetrievedContext {
            formatted: format_documents(&hits),
            top_score: hits.first().map(|hit| hit.score),
        })
    }
}

pub fn format_documents(hits: &[ScoredChunk]) -> String {
    if hits.is_empty() {
        return NO_RELEVANT_INFORMATION.to_string();
    }
    hits.iter().map(|hit| format!("DOCUMENT: {}", hit.chunk.text)).collect::<Vec<_>>().join("\n\n")
}

pub struct AnswerCapability {
    generator: Arc<dyn GenerationProvider>,
    templates: Tera,
    policy: EscalationPolicy,
    timeout: Duration,
}

impl AnswerCapability {
    pub fn new(
        generator: Arc<dyn GenerationProvider>,
        policy: EscalationPolicy,
        timeout: Duration,
    ) -> Result<Self, ApplicationError> {
        let mut templates = Tera::default();
        templates
            .add_raw_template(ANSWER_TEMPLATE_NAME, &answer_template(policy.sentinel()))
            .map_err(|error| {
                ApplicationError::Configuration(format!("answer prompt template: {error}"))
            })?;
        Ok(Self { generator, templates, policy, timeout })
    }

    pub fn render_prompt(&self, context: &str, question: &str) -> Result<String, ApplicationError> {
        let mut values = Context::new();
        values.insert("context", context);
        values.insert("question", question);
        self.templates.render(ANSWER_TEMPLATE_NAME, &values).map_err(|error| {
            ApplicationError::Configuration(format!("answer prompt render: {error}"))
        })
    }

    /// One provider call, no retries. Blank inputs fail before the provider
    /// is reached.
    pub async fn generate(
        &self,
        context: &str,
        question: &str,
    ) -> Result<GeneratedAnswer, ApplicationError> {
        if context.trim().is_empty() {
            return Err(DomainError::MissingInput { field: "context" }.into());
        }
        if question.trim().is_empty() {
            return Err(DomainError::MissingInput { field: "question" }.into());
        }

        let prompt = self.render_prompt(context, question)?;
        let text = match tokio::time::timeout(self.timeout, self.generator.generate(&prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(error)) => return Err(generation_failure(error)),
            Err(_) => return Err(generation_failure(ProviderError::Timeout(self.timeout))),
        };

        let escalate = self.policy.requires_human(&text);
        Ok(GeneratedAnswer { text, escalate })
    }
}

fn generation_failure(error: ProviderError) -> ApplicationError {
    warn!(event_name = "answer.generation_failed", error = %error, "generation provider call failed");
    ApplicationError::GenerationFailure(error.to_string())
}

fn answer_template(sentinel: &str) -> String {
    format!(
        "You are a helpful AI sales agent.

Use the following context to answer the user's question.
If you don't know the answer based on the context, say that you will check with the team \
and end your reply with the exact marker {{% raw %}}{sentinel}{{% endraw %}}

Context: {{{{ context }}}}

User Question: {{{{ question }}}}

Answer:"
    )
}

/// Name-keyed dispatch over the closed capability set.
pub struct Toolbox {
    table: HashMap<&'static str, CapabilityKind>,
    knowledge: Arc<KnowledgeBaseManager>,
    retrieval: RetrievalCapability,
    answer: AnswerCapability,
}

impl Toolbox {
    pub fn new(
        knowledge: Arc<KnowledgeBaseManager>,
        retrieval: RetrievalCapability,
        answer: AnswerCapability,
    ) -> Self {
        let table = CAPABILITIES.iter().map(|descriptor| (descriptor.name, descriptor.kind)).collect();
        Self { table, knowledge, retrieval, answer }
    }

    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        CAPABILITIES.to_vec()
    }

    pub fn resolve(&self, name: &str) -> Option<CapabilityKind> {
        self.table.get(name).copied()
    }

    pub async fn invoke_by_name(
        &self,
        name: &str,
        kb: &KnowledgeBase,
        input: CapabilityInput,
    ) -> Result<CapabilityOutput, ApplicationError> {
        match self.resolve(name) {
            Some(kind) if kind == input.kind() => self.invoke(kb, input).await,
            Some(kind) => Err(DomainError::MalformedInput(format!(
                "capability `{name}` expects {kind:?} input, got {:?}",
                input.kind()
            ))
            .into()),
            None => Err(DomainError::MalformedInput(format!("unknown capability `{name}`")).into()),
        }
    }

    pub async fn invoke(
        &self,
        kb: &KnowledgeBase,
        input: CapabilityInput,
    ) -> Result<CapabilityOutput, ApplicationError> {
        match input {
            CapabilityInput::Retrieve { query } => {
                Ok(CapabilityOutput::Retrieved(self.retrieval.retrieve(kb, &query).await?))
            }
            CapabilityInput::Generate { context, question } => {
                Ok(CapabilityOutput::Generated(self.answer.generate(&context, &question).await?))
            }
            CapabilityInput::UpdateKnowledge { text, source_ref } => {
                Ok(CapabilityOutput::KnowledgeUpdated(self.knowledge.add(kb, &text, &source_ref).await?))
            }
        }
    }
}
