//! Resilience guards for reasoning calls.
//!
//! - Circuit breaker per role
//! - Token budgets, split per role before each evaluate stage

mod budget;
mod circuit_breaker;

pub use budget::{BudgetTracker, LlmUsage, TokenBudget};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
