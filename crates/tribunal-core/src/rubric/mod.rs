//! Rubric loading and validation.
//!
//! A rubric is static configuration: the criteria being scored, each with a
//! role weight table, plus the synthesis and coercion policies. Files are
//! validated against an embedded JSON Schema before deserialization.

mod parser;
mod schema;

pub use parser::{
    default_role_weights, CoercionPolicy, Criterion, Rubric, RubricError, SynthesisPolicy,
    WEIGHT_SCALE, WEIGHT_SUM_TOLERANCE,
};
pub use schema::{validate_rubric_schema, SchemaError};
