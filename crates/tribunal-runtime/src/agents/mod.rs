//! Collectors and evaluators.
//!
//! Collectors gather evidence in isolation; evaluators score criteria
//! against a frozen snapshot of that evidence, one role each.

mod persona;
mod traits;

pub use persona::{PersonaConfig, PersonaEvaluator};
pub use traits::{
    AgentError, AggregationHook, Collector, Elicitation, EvaluationRequest, Evaluator,
};
