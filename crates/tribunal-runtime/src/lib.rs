//! # tribunal-runtime
//!
//! Staged, parallel execution of review runs.
//!
//! `tribunal-core` holds the deterministic parts (reducers, coercion,
//! synthesis). This crate drives the asynchronous parts around them:
//!
//! - Collectors gather evidence concurrently, each in its own namespace
//! - Evaluators (one per role) score every criterion against a frozen
//!   evidence snapshot, usually through a reasoning provider
//! - Barriers merge task buffers with order-independent reducers
//!
//! Timeouts, retries with backoff, a per-role circuit breaker, token
//! budgets and an opinion cache guard every external call. In resilient
//! mode failures become placeholders and degraded sentinels; in fail-fast
//! mode the first unrecoverable error aborts with the partial state.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tribunal_runtime::{AnthropicProvider, PersonaConfig, PersonaEvaluator, RunOrchestrator};
//!
//! let provider = Arc::new(AnthropicProvider::from_env()?);
//! let orchestrator = RunOrchestrator::builder()
//!     .collector(Arc::new(RepoCollector::new()))
//!     .evaluators(
//!         PersonaEvaluator::bench(provider, PersonaConfig::default())
//!             .into_iter()
//!             .map(|e| Arc::new(e) as _),
//!     )
//!     .build()?;
//!
//! let report = orchestrator.run(&rubric, &subject).await?;
//! ```

pub mod agents;
pub mod cache;
pub mod config;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod resilience;

pub use agents::{
    AgentError, AggregationHook, Collector, Elicitation, EvaluationRequest, Evaluator,
    PersonaConfig, PersonaEvaluator,
};
pub use cache::{CacheKey, OpinionCache};
pub use config::{BudgetConfig, CacheConfig, FailMode, RetryConfig, RuntimeConfig};
pub use orchestrator::{RunOrchestrator, RunOrchestratorBuilder, RunReport};
pub use providers::{
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError, TokenUsage,
};
pub use resilience::{BudgetTracker, CircuitBreaker, CircuitBreakerConfig, LlmUsage};

#[cfg(feature = "anthropic")]
pub use providers::AnthropicProvider;

use thiserror::Error;
use tribunal_core::{ErrorRecord, ReconcileError, RunState, Stage, StateError};

/// Errors from the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Fail-fast abort. `partial` is the frozen state at the barrier.
    #[error("Run aborted at {stage}: {cause}")]
    Aborted {
        stage: Stage,
        cause: ErrorRecord,
        partial: Box<RunState>,
    },

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

impl RuntimeError {
    /// Partial state carried by a fail-fast abort.
    pub fn partial_state(&self) -> Option<&RunState> {
        match self {
            RuntimeError::Aborted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tribunal_core::ErrorKind;

    #[test]
    fn test_abort_message_names_stage_and_cause() {
        let err = RuntimeError::Aborted {
            stage: Stage::Aggregate,
            cause: ErrorRecord::new(
                Stage::Collect,
                "repo",
                ErrorKind::CollectorFailure,
                "Timeout after 60s",
            ),
            partial: Box::new(RunState::new()),
        };
        let message = err.to_string();
        assert!(message.starts_with("Run aborted at aggregate"));
        assert!(message.contains("repo"));
        assert!(err.partial_state().is_some());
        assert!(RuntimeError::Configuration("x".into()).partial_state().is_none());
    }
}
