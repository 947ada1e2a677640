//! # tribunal-core
//!
//! Deterministic evidence aggregation and verdict synthesis for
//! multi-evaluator review runs.
//!
//! Several independent evaluators (a critical, a supportive and a pragmatic
//! reviewer) score the same subject against a rubric. This crate holds the
//! parts of that process that must never depend on timing:
//!
//! - **Evidence store**: namespaced findings merged by a mapping-union reducer
//! - **Opinion set**: at most one opinion per (criterion, role), keyed-replace
//! - **Coercion**: raw evaluator output validated and grounded into opinions
//! - **Synthesis**: opinions reconciled into a verdict by fixed rules
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: Same inputs always produce the same verdicts
//! 2. **Order-independent**: Every merge is commutative, associative and idempotent
//! 3. **Grounded**: Opinions only cite evidence that exists in the store
//! 4. **Explicit shortages**: A criterion without usable opinions gets
//!    `InsufficientData`, never a default score
//!
//! ## Example
//!
//! ```rust,ignore
//! use tribunal_core::{reconcile, Rubric, RunState};
//!
//! let rubric = Rubric::from_file("rubric.yaml")?;
//! let mut state = RunState::new();
//! state.merge_evidence(partials)?;
//! state.merge_opinions(opinions)?;
//!
//! for outcome in reconcile(&rubric, &mut state)? {
//!     println!("{}: {:?}", outcome.criterion_id(), outcome.final_score());
//! }
//! ```

pub mod coercion;
pub mod evidence;
pub mod opinions;
pub mod rubric;
pub mod state;
pub mod synthesizer;
pub mod types;

// Re-export main types at crate root
pub use coercion::{Coerced, Coercer, RawOutput, SchemaRejection};
pub use evidence::{
    CollectorTally, Evidence, EvidenceError, EvidenceKey, EvidencePartial, EvidenceStore,
};
pub use opinions::{Opinion, OpinionKey, OpinionSet};
pub use rubric::{CoercionPolicy, Criterion, Rubric, RubricError, SynthesisPolicy};
pub use state::{RunState, StateError};
pub use synthesizer::{
    CriterionOutcome, Dissent, OpinionDigest, RuleApplied, SynthesisEngine, SynthesisError,
    VerdictRecord,
};
pub use types::{ErrorKind, ErrorRecord, Role, Score, Stage, Subject};

use thiserror::Error;

/// Errors that can occur while reconciling a run.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Synthesize every rubric criterion from a run state, then freeze it.
///
/// Criteria without usable opinions are logged as
/// `SynthesisInputShortage` records before the state is frozen. Outcomes
/// are returned in rubric order.
pub fn reconcile(rubric: &Rubric, state: &mut RunState) -> Result<Vec<CriterionOutcome>, ReconcileError> {
    let engine = SynthesisEngine::new(rubric.synthesis.clone())?;
    let outcomes = engine.synthesize_all(rubric, state.opinions(), state.evidence());

    state.record_errors(outcomes.iter().filter_map(CriterionOutcome::shortage_record))?;
    state.freeze();

    Ok(outcomes)
}
