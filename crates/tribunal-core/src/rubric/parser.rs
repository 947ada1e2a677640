//! Rubric parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::schema::validate_rubric_schema;
use crate::types::{Role, Score};

/// Tolerance when checking that role weights sum to 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Weights are converted to integer basis points for exact arithmetic.
pub const WEIGHT_SCALE: f64 = 10_000.0;

/// Errors that can occur when loading a rubric.
#[derive(Error, Debug)]
pub enum RubricError {
    #[error("Failed to read rubric file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Rubric does not match schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),

    #[error("Rubric validation failed: {0}")]
    ValidationError(String),
}

/// One scored dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    /// Unique identifier (e.g. "state_management")
    pub id: String,

    /// Human-readable name
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Artifact kind this criterion is judged on (e.g. "repository")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_artifact: Option<String>,

    /// What collectors were asked to look for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forensic_instruction: Option<String>,

    /// Role weight table; must sum to 1.0
    #[serde(default = "default_role_weights")]
    pub role_weights: BTreeMap<Role, f64>,

    /// Per-persona instructions
    #[serde(default)]
    pub judicial_logic: BTreeMap<Role, String>,
}

/// Pragmatic reviewer counts double, the other two share the rest.
pub fn default_role_weights() -> BTreeMap<Role, f64> {
    BTreeMap::from([
        (Role::Critical, 0.25),
        (Role::Supportive, 0.25),
        (Role::Pragmatic, 0.5),
    ])
}

impl Criterion {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            target_artifact: None,
            forensic_instruction: None,
            role_weights: default_role_weights(),
            judicial_logic: BTreeMap::new(),
        }
    }

    pub fn with_weights(mut self, weights: impl IntoIterator<Item = (Role, f64)>) -> Self {
        self.role_weights = weights.into_iter().collect();
        self
    }

    pub fn with_target(mut self, artifact: impl Into<String>) -> Self {
        self.target_artifact = Some(artifact.into());
        self
    }

    /// Weight of a role; roles absent from the table weigh nothing.
    pub fn weight(&self, role: Role) -> f64 {
        self.role_weights.get(&role).copied().unwrap_or(0.0)
    }

    /// Weight of a role in integer basis points.
    pub fn weight_units(&self, role: Role) -> u64 {
        (self.weight(role) * WEIGHT_SCALE).round() as u64
    }

    /// Roles with a non-zero weight, in canonical order.
    pub fn weighted_roles(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|r| self.weight_units(*r) > 0)
            .collect()
    }

    fn validate(&self) -> Result<(), RubricError> {
        for (role, weight) in &self.role_weights {
            if !weight.is_finite() || *weight < 0.0 || *weight > 1.0 {
                return Err(RubricError::ValidationError(format!(
                    "criterion '{}': weight for {} must be within [0, 1], got {}",
                    self.id, role, weight
                )));
            }
        }

        let sum: f64 = self.role_weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(RubricError::ValidationError(format!(
                "criterion '{}': role weights must sum to 1.0, got {}",
                self.id, sum
            )));
        }

        Ok(())
    }
}

/// Conflict-resolution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisPolicy {
    /// Role acting as the adversarial reviewer
    #[serde(default = "default_critical_role")]
    pub critical_role: Role,

    /// Words in the critical rationale that signal a disqualifying flaw
    #[serde(default = "default_severity_keywords")]
    pub severity_keywords: Vec<String>,

    /// Ceiling applied by the severity cap
    #[serde(default = "default_cap_score")]
    pub cap_score: Score,

    /// Spread (max - min) at or above which a verdict needs human review
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: u8,

    /// Minimum score at which citing not-found evidence is a contradiction
    #[serde(default = "default_contradiction_min_score")]
    pub contradiction_min_score: Score,
}

fn default_critical_role() -> Role {
    Role::Critical
}

fn default_severity_keywords() -> Vec<String> {
    ["security", "vulnerability", "injection", "traversal", "credential leak"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cap_score() -> Score {
    Score::new(3).unwrap_or(Score::MIN)
}

fn default_variance_threshold() -> u8 {
    3
}

fn default_contradiction_min_score() -> Score {
    Score::new(4).unwrap_or(Score::MAX)
}

impl Default for SynthesisPolicy {
    fn default() -> Self {
        Self {
            critical_role: default_critical_role(),
            severity_keywords: default_severity_keywords(),
            cap_score: default_cap_score(),
            variance_threshold: default_variance_threshold(),
            contradiction_min_score: default_contradiction_min_score(),
        }
    }
}

/// Output coercion settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoercionPolicy {
    /// Minimum rationale length in characters
    #[serde(default = "default_min_rationale_len")]
    pub min_rationale_len: usize,

    /// Score carried by the degraded sentinel
    #[serde(default = "default_neutral_score")]
    pub neutral_score: Score,
}

fn default_min_rationale_len() -> usize {
    100
}

fn default_neutral_score() -> Score {
    Score::new(3).unwrap_or(Score::MIN)
}

impl Default for CoercionPolicy {
    fn default() -> Self {
        Self {
            min_rationale_len: default_min_rationale_len(),
            neutral_score: default_neutral_score(),
        }
    }
}

/// A complete rubric: criteria plus the policies that score them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub rubric_version: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub criteria: Vec<Criterion>,

    #[serde(default)]
    pub synthesis: SynthesisPolicy,

    #[serde(default)]
    pub coercion: CoercionPolicy,
}

impl Rubric {
    /// Build a rubric in code. Validates like the file loaders.
    pub fn new(name: impl Into<String>, criteria: Vec<Criterion>) -> Result<Self, RubricError> {
        let rubric = Self {
            rubric_version: "1.0".to_string(),
            name: name.into(),
            description: None,
            criteria,
            synthesis: SynthesisPolicy::default(),
            coercion: CoercionPolicy::default(),
        };
        rubric.validate()?;
        Ok(rubric)
    }

    /// Parse a rubric from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, RubricError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a rubric from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, RubricError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Load a rubric file; `.json` is parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RubricError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let rubric = if is_json {
            Self::from_json(&contents)?
        } else {
            Self::from_yaml(&contents)?
        };

        tracing::info!(
            path = %path.display(),
            criteria = rubric.criteria.len(),
            "Loaded rubric"
        );
        Ok(rubric)
    }

    fn from_value(value: serde_json::Value) -> Result<Self, RubricError> {
        validate_rubric_schema(&value).map_err(RubricError::SchemaViolation)?;
        let rubric: Rubric = serde_json::from_value(value)?;
        rubric.validate()?;
        Ok(rubric)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), RubricError> {
        if self.name.trim().is_empty() {
            return Err(RubricError::ValidationError("name must not be empty".to_string()));
        }

        if self.criteria.is_empty() {
            return Err(RubricError::ValidationError(
                "rubric must define at least one criterion".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for criterion in &self.criteria {
            if !seen.insert(criterion.id.as_str()) {
                return Err(RubricError::ValidationError(format!(
                    "Duplicate criterion ID: {}",
                    criterion.id
                )));
            }
            criterion.validate()?;
        }

        if self.synthesis.variance_threshold > 4 {
            return Err(RubricError::ValidationError(format!(
                "variance_threshold must be within 0..=4, got {}",
                self.synthesis.variance_threshold
            )));
        }

        if self
            .synthesis
            .severity_keywords
            .iter()
            .any(|k| k.trim().is_empty())
        {
            return Err(RubricError::ValidationError(
                "severity keywords must not be blank".to_string(),
            ));
        }

        Ok(())
    }

    pub fn criterion(&self, id: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.id == id)
    }

    pub fn criterion_ids(&self) -> impl Iterator<Item = &str> {
        self.criteria.iter().map(|c| c.id.as_str())
    }
}
