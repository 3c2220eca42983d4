//! Bounded per-turn decision loop over the capability set.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use concierge_core::errors::ApplicationError;

use crate::guardrails::{EscalationDecision, EscalationPolicy};
use crate::knowledge::KnowledgeBase;
use crate::tools::{CapabilityInput, CapabilityOutput, GeneratedAnswer, Toolbox};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Answer { text: String },
    Handoff { query: String },
    GenerationFailure { message: String },
}

/// A turn outcome plus the best retrieval similarity seen along the way,
/// clamped to `0.0..=1.0`. `None` when nothing was retrieved.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub confidence: Option<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlannedStep {
    Retrieve,
    Generate,
    Finish,
}

/// Per-turn working memory. Dropped when the turn ends.
#[derive(Clone, Debug, Default)]
pub struct Scratchpad {
    pub question: String,
    pub context: Option<String>,
    pub top_score: Option<f32>,
    pub answer: Option<GeneratedAnswer>,
    pub nonconforming: u32,
    pub steps_taken: u32,
}

impl Scratchpad {
    fn new(question: &str) -> Self {
        Self { question: question.to_string(), ..Self::default() }
    }
}

pub trait Planner: Send + Sync {
    fn next_step(&self, scratchpad: &Scratchpad) -> PlannedStep;
}

/// Retrieve once, generate until a non-blank answer exists, then finish.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetrieveThenAnswer;

impl Planner for RetrieveThenAnswer {
    fn next_step(&self, scratchpad: &Scratchpad) -> PlannedStep {
        match (&scratchpad.context, &scratchpad.answer) {
            (None, _) => PlannedStep::Retrieve,
            (Some(_), None) => PlannedStep::Generate,
            (Some(_), Some(_)) => PlannedStep::Finish,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 200, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

const UNAVAILABLE_MESSAGE: &str =
    "Sorry, I couldn't reach the assistant just now. Please try again in a moment.";

pub struct AgentRuntime {
    toolbox: Arc<Toolbox>,
    planner: Box<dyn Planner>,
    policy: EscalationPolicy,
    max_steps: u32,
    retry: RetryPolicy,
}

impl AgentRuntime {
    pub fn new(
        toolbox: Arc<Toolbox>,
        policy: EscalationPolicy,
        max_steps: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self { toolbox, planner: Box::new(RetrieveThenAnswer), policy, max_steps, retry }
    }

    pub fn with_planner(mut self, planner: impl Planner + 'static) -> Self {
        self.planner = Box::new(planner);
        self
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    pub async fn run_turn(&self, kb: &KnowledgeBase, user_text: &str) -> TurnOutcome {
        self.run_turn_scored(kb, user_text).await.outcome
    }

    pub async fn run_turn_scored(&self, kb: &KnowledgeBase, user_text: &str) -> TurnReport {
        let mut scratchpad = Scratchpad::new(user_text);
        let outcome = self.drive(kb, &mut scratchpad).await;
        TurnReport { outcome, confidence: scratchpad.top_score.map(|score| score.clamp(0.0, 1.0)) }
    }

    async fn drive(&self, kb: &KnowledgeBase, scratchpad: &mut Scratchpad) -> TurnOutcome {
        loop {
            let step = self.planner.next_step(scratchpad);
            if step != PlannedStep::Finish && scratchpad.steps_taken >= self.max_steps {
                info!(
                    event_name = "agent.step_budget_exhausted",
                    tenant_id = %kb.tenant_id(),
                    max_steps = self.max_steps,
                    nonconforming = scratchpad.nonconforming,
                    "step budget exhausted; escalating to a human"
                );
                return TurnOutcome::Handoff { query: scratchpad.question.clone() };
            }

            match step {
                PlannedStep::Finish => return self.finish(kb, scratchpad),
                PlannedStep::Retrieve => {
                    scratchpad.steps_taken += 1;
                    let input = CapabilityInput::Retrieve { query: scratchpad.question.clone() };
                    match self.invoke_with_retry(kb, input).await {
                        Ok(CapabilityOutput::Retrieved(retrieved)) => {
                            scratchpad.top_score = retrieved.top_score;
                            scratchpad.context = Some(retrieved.formatted);
                        }
                        Ok(other) => return unexpected_output(kb, other),
                        Err(error) => return self.failure(kb, error),
                    }
                }
                PlannedStep::Generate => {
                    scratchpad.steps_taken += 1;
                    let input = CapabilityInput::Generate {
                        context: scratchpad.context.clone().unwrap_or_default(),
                        question: scratchpad.question.clone(),
                    };
                    match self.invoke_with_retry(kb, input).await {
                        Ok(CapabilityOutput::Generated(answer)) if answer.escalate => {
                            info!(
                                event_name = "agent.escalated",
                                tenant_id = %kb.tenant_id(),
                                "answer carried the escalation sentinel"
                            );
                            return TurnOutcome::Handoff { query: scratchpad.question.clone() };
                        }
                        Ok(CapabilityOutput::Generated(answer))
                            if self.policy.clean(&answer.text).is_empty() =>
                        {
                            scratchpad.nonconforming += 1;
                            debug!(
                                event_name = "agent.nonconforming_output",
                                tenant_id = %kb.tenant_id(),
                                attempt = scratchpad.nonconforming,
                                "generated answer was blank"
                            );
                        }
                        Ok(CapabilityOutput::Generated(answer)) => scratchpad.answer = Some(answer),
                        Ok(other) => return unexpected_output(kb, other),
                        Err(error) => return self.failure(kb, error),
                    }
                }
            }
        }
    }

    fn finish(&self, kb: &KnowledgeBase, scratchpad: &mut Scratchpad) -> TurnOutcome {
        let Some(answer) = scratchpad.answer.take() else {
            return TurnOutcome::Handoff { query: scratchpad.question.clone() };
        };
        match self.policy.evaluate(&answer.text) {
            EscalationDecision::Escalate => {
                TurnOutcome::Handoff { query: scratchpad.question.clone() }
            }
            EscalationDecision::Deliver { text } => {
                debug!(
                    event_name = "agent.answered",
                    tenant_id = %kb.tenant_id(),
                    steps = scratchpad.steps_taken,
                    "turn produced an answer"
                );
                TurnOutcome::Answer { text }
            }
        }
    }

    fn failure(&self, kb: &KnowledgeBase, error: ApplicationError) -> TurnOutcome {
        warn!(
            event_name = "agent.turn_failed",
            tenant_id = %kb.tenant_id(),
            error = %error,
            "turn ended with a generation failure"
        );
        let message = if error.is_transient() {
            UNAVAILABLE_MESSAGE.to_string()
        } else {
            error.into_interface("turn").user_message().to_string()
        };
        TurnOutcome::GenerationFailure { message }
    }

    async fn invoke_with_retry(
        &self,
        kb: &KnowledgeBase,
        input: CapabilityInput,
    ) -> Result<CapabilityOutput, ApplicationError> {
        let mut attempt = 0;
        loop {
            match self.toolbox.invoke(kb, input.clone()).await {
                Ok(output) => return Ok(output),
                Err(error) if error.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        event_name = "agent.capability_retry",
                        tenant_id = %kb.tenant_id(),
                        capability = input.kind().descriptor().name,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "capability failed; retrying"
                    );
                    attempt += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn unexpected_output(kb: &KnowledgeBase, output: CapabilityOutput) -> TurnOutcome {
    warn!(
        event_name = "agent.unexpected_output",
        tenant_id = %kb.tenant_id(),
        output = ?output,
        "capability returned output for a different step"
    );
    TurnOutcome::GenerationFailure { message: UNAVAILABLE_MESSAGE.to_string() }
}
