//! Collector, evaluator and aggregation-hook traits.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tribunal_core::{Criterion, EvidencePartial, EvidenceStore, RawOutput, Role, Subject};

use crate::providers::{ProviderError, TokenUsage};

/// Errors from collectors and evaluators.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Budget exceeded for {0}")]
    BudgetExceeded(Role),

    #[error("Circuit open for {0}")]
    CircuitOpen(Role),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Collection failed: {0}")]
    Collection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Contract violations and refusals by resilience guards are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Provider(ProviderError::NotConfigured(_)) => false,
            AgentError::Provider(_) | AgentError::Timeout(_) | AgentError::Collection(_) => true,
            AgentError::BudgetExceeded(_)
            | AgentError::CircuitOpen(_)
            | AgentError::ContractViolation(_)
            | AgentError::Internal(_) => false,
        }
    }
}

/// A task that inspects the subject and produces namespaced evidence.
///
/// # Isolation Contract
/// - MUST only write entries under its own `id()`
/// - MUST treat the subject as read-only
/// - MUST NOT see other collectors' evidence
#[async_trait]
pub trait Collector: Send + Sync {
    /// Namespace for every entry this collector writes.
    fn id(&self) -> &str;

    /// Artifact kind this collector inspects, if any.
    fn target(&self) -> Option<&str> {
        None
    }

    /// Locations this collector normally reports on.
    ///
    /// Used to place `found=false` placeholders when the collector fails in
    /// resilient mode. Empty means "the target artifact's location".
    fn expected_locations(&self, _subject: &Subject) -> Vec<String> {
        Vec::new()
    }

    async fn collect(&self, subject: &Subject) -> Result<EvidencePartial, AgentError>;
}

/// Pure post-aggregation step deriving extra evidence from the merged store.
pub trait AggregationHook: Send + Sync {
    /// Namespace of the derived entries.
    fn id(&self) -> &str;

    fn derive(&self, store: &EvidenceStore) -> EvidencePartial;
}

/// Everything an evaluator sees when scoring one criterion.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub criterion: Criterion,

    /// Frozen evidence snapshot shared by every evaluator
    pub evidence: Arc<EvidenceStore>,

    /// Role-specific scoring guidance from the rubric
    pub judicial_logic: Option<String>,

    /// Collectors registered for the criterion's target artifact, if it has one
    pub relevant_collectors: Option<Vec<String>>,

    /// Shortest rationale the coercion policy accepts
    pub min_rationale_len: usize,

    /// Rejection feedback from the previous attempt
    pub feedback: Option<String>,

    /// Zero-based elicitation index
    pub attempt: u32,
}

impl EvaluationRequest {
    /// Evidence restricted to the relevant collectors, or the whole snapshot.
    pub fn scoped_evidence(&self) -> EvidenceStore {
        match &self.relevant_collectors {
            Some(ids) => {
                let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
                self.evidence.restricted_to(&ids)
            }
            None => (*self.evidence).clone(),
        }
    }
}

/// Raw evaluator output plus what producing it cost.
#[derive(Debug, Clone)]
pub struct Elicitation {
    pub output: RawOutput,
    pub usage: TokenUsage,
}

impl Elicitation {
    /// Output that did not involve a metered call.
    pub fn free(output: impl Into<RawOutput>) -> Self {
        Self {
            output: output.into(),
            usage: TokenUsage::default(),
        }
    }
}

/// An independent reviewer with a fixed role.
///
/// # Isolation Contract
/// - MUST NOT see other evaluators' opinions
/// - MUST only cite evidence present in the request snapshot
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn role(&self) -> Role;

    /// Criterion ids this evaluator scores. `None` means all of them.
    fn criteria(&self) -> Option<Vec<String>> {
        None
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Elicitation, AgentError>;
}
