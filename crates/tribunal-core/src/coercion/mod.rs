//! Output coercion layer.
//!
//! Evaluators return loosely structured output. This module turns it into a
//! grounded [`Opinion`] or a typed [`SchemaRejection`] the caller can feed
//! back on re-elicitation. The retry loop itself lives in the runtime,
//! because re-eliciting is asynchronous; everything here is pure.
//!
//! Pipeline: extract → repair → validate (JSON Schema + typed checks) →
//! ground citations against the evidence store.

mod grounding;
mod parse;

pub use grounding::{ground, Grounded};
pub use parse::{extract_payload, normalize};

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

use crate::evidence::EvidenceStore;
use crate::opinions::Opinion;
use crate::rubric::{CoercionPolicy, Criterion};
use crate::types::{ErrorRecord, Role, Score};

/// Embedded payload schema.
const OPINION_SCHEMA_JSON: &str = include_str!("../../schema/opinion.schema.json");

static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Raw evaluator output as received from the reasoning seam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RawOutput {
    Text(String),
    Structured(serde_json::Value),
}

impl From<String> for RawOutput {
    fn from(text: String) -> Self {
        RawOutput::Text(text)
    }
}

impl From<serde_json::Value> for RawOutput {
    fn from(value: serde_json::Value) -> Self {
        RawOutput::Structured(value)
    }
}

/// Why a raw output could not become an opinion.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaRejection {
    #[error("No JSON object or score could be found in the output")]
    NoPayload,

    #[error("Payload does not match the opinion schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),

    #[error("Rationale is {actual} characters; at least {required} are required")]
    RationaleTooShort { actual: usize, required: usize },

    #[error("Payload scores criterion '{found}' but '{expected}' was requested")]
    CriterionMismatch { expected: String, found: String },
}

impl SchemaRejection {
    /// Correction text appended to the next elicitation.
    pub fn feedback(&self) -> String {
        format!(
            "Your previous answer was rejected: {}. Reply with a single JSON object \
             {{\"score\": <integer 1-5>, \"rationale\": \"<text>\", \"cited_evidence\": [\"collector:location\", ...]}}.",
            self
        )
    }
}

/// A coerced opinion plus the grounding violations recorded on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Coerced {
    pub opinion: Opinion,
    pub violations: Vec<ErrorRecord>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    criterion_id: Option<String>,
    score: u8,
    rationale: String,
    cited_evidence: Vec<String>,
}

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(OPINION_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });
    result.as_ref().map_err(Clone::clone)
}

/// Validates and grounds raw evaluator output.
#[derive(Debug, Clone, Default)]
pub struct Coercer {
    policy: CoercionPolicy,
}

impl Coercer {
    pub fn new(policy: CoercionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CoercionPolicy {
        &self.policy
    }

    /// Coerce one raw output into an opinion for `(criterion, role)`.
    pub fn coerce(
        &self,
        raw: &RawOutput,
        criterion: &Criterion,
        role: Role,
        store: &EvidenceStore,
        attempt: u32,
    ) -> Result<Coerced, SchemaRejection> {
        let payload = extract_payload(raw).ok_or(SchemaRejection::NoPayload)?;
        let payload = self.validate(normalize(payload), &criterion.id)?;

        let grounded = ground(payload.cited_evidence.iter().map(String::as_str), store);
        let violations = grounded.violations(&criterion.id, role);
        if !violations.is_empty() {
            tracing::warn!(
                criterion = %criterion.id,
                role = %role,
                pruned = violations.len(),
                "Pruned ungrounded citations"
            );
        }

        let score = Score::new(payload.score).ok_or_else(|| {
            SchemaRejection::SchemaViolation(vec![format!("score {} outside 1..=5", payload.score)])
        })?;

        let opinion = Opinion::new(&criterion.id, role, score, grounded.annotate(&payload.rationale))
            .citing(grounded.kept)
            .with_attempt(attempt);

        Ok(Coerced { opinion, violations })
    }

    fn validate(&self, value: serde_json::Value, criterion_id: &str) -> Result<Payload, SchemaRejection> {
        let validator =
            get_validator().map_err(|e| SchemaRejection::SchemaViolation(vec![e]))?;

        let errors: Vec<String> = validator
            .iter_errors(&value)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        if !errors.is_empty() {
            return Err(SchemaRejection::SchemaViolation(errors));
        }

        let payload: Payload = serde_json::from_value(value)
            .map_err(|e| SchemaRejection::SchemaViolation(vec![e.to_string()]))?;

        if let Some(found) = &payload.criterion_id {
            if found != criterion_id {
                return Err(SchemaRejection::CriterionMismatch {
                    expected: criterion_id.to_string(),
                    found: found.clone(),
                });
            }
        }

        let actual = payload.rationale.trim().chars().count();
        if actual < self.policy.min_rationale_len {
            return Err(SchemaRejection::RationaleTooShort {
                actual,
                required: self.policy.min_rationale_len,
            });
        }

        Ok(payload)
    }

    /// Neutral fallback emitted once re-elicitation is exhausted.
    pub fn degraded_sentinel(
        &self,
        criterion_id: &str,
        role: Role,
        reason: &str,
        attempt: u32,
    ) -> Opinion {
        let rationale = format!(
            "No valid opinion could be obtained from the {} evaluator ({}). \
             Neutral score {} assigned as a degraded fallback.",
            role.persona_name(),
            reason,
            self.policy.neutral_score
        );
        let mut opinion = Opinion::new(criterion_id, role, self.policy.neutral_score, rationale)
            .with_attempt(attempt);
        opinion.degraded = true;
        opinion
    }
}
