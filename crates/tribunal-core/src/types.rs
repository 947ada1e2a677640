//! Core types shared by every stage of a run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Evaluator persona.
///
/// A closed set: weights and prompts are data keyed by this enum, never
/// behaviour attached to it. The declaration order is the iteration order of
/// every `BTreeMap<Role, _>` in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Adversarial reviewer. Looks for flaws and disqualifying defects.
    Critical,
    /// Charitable reviewer. Credits intent and effort.
    Supportive,
    /// Practical reviewer. Judges whether the thing actually works.
    Pragmatic,
}

impl Role {
    /// All roles in canonical order.
    pub const ALL: [Role; 3] = [Role::Critical, Role::Supportive, Role::Pragmatic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Critical => "critical",
            Role::Supportive => "supportive",
            Role::Pragmatic => "pragmatic",
        }
    }

    /// Human-facing persona name used in prompts and logs.
    pub fn persona_name(&self) -> &'static str {
        match self {
            Role::Critical => "Prosecutor",
            Role::Supportive => "Defense",
            Role::Pragmatic => "Tech Lead",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "prosecutor" => Ok(Role::Critical),
            "supportive" | "defense" => Ok(Role::Supportive),
            "pragmatic" | "tech_lead" | "techlead" => Ok(Role::Pragmatic),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A score on the closed 1..=5 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Score(u8);

impl Score {
    pub const MIN: Score = Score(1);
    pub const MAX: Score = Score(5);

    /// Create a score, rejecting values outside 1..=5.
    pub fn new(value: u8) -> Option<Self> {
        (1..=5).contains(&value).then_some(Score(value))
    }

    /// Create a score by clamping into 1..=5.
    pub fn clamped(value: i64) -> Self {
        Score(value.clamp(1, 5) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Score {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Score::new(value).ok_or_else(|| format!("score {} outside 1..=5", value))
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> u8 {
        score.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The shared subject every collector inspects.
///
/// `artifacts` maps an artifact kind (e.g. "repository", "report") to its
/// location. Collectors only ever read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,

    #[serde(default)]
    pub artifacts: std::collections::BTreeMap<String, String>,
}

impl Subject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifacts: Default::default(),
        }
    }

    pub fn with_artifact(mut self, kind: impl Into<String>, location: impl Into<String>) -> Self {
        self.artifacts.insert(kind.into(), location.into());
        self
    }

    /// Location of an artifact, falling back to the subject name.
    pub fn location_of(&self, kind: Option<&str>) -> &str {
        kind.and_then(|k| self.artifacts.get(k))
            .map(String::as_str)
            .unwrap_or(&self.name)
    }
}

/// Pipeline stage a record originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Collect,
    Aggregate,
    Evaluate,
    Reconcile,
    Synthesize,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Collect => "collect",
            Stage::Aggregate => "aggregate",
            Stage::Evaluate => "evaluate",
            Stage::Reconcile => "reconcile",
            Stage::Synthesize => "synthesize",
            Stage::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// Error taxonomy for the run's error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A collector task errored or timed out.
    CollectorFailure,
    /// A reasoning call errored, timed out, or was refused by resilience guards.
    EvaluatorFailure,
    /// Evaluator output stayed malformed after every re-elicitation.
    SchemaValidationFailure,
    /// A citation was not present in the evidence store. Recovered by pruning.
    GroundingViolation,
    /// A criterion had no usable opinions left.
    SynthesisInputShortage,
}

impl ErrorKind {
    /// Whether this kind aborts a fail-fast run.
    pub fn is_unrecoverable(&self) -> bool {
        !matches!(self, ErrorKind::GroundingViolation | ErrorKind::SynthesisInputShortage)
    }
}

/// A typed entry in the run's error log.
///
/// Ordered by (stage, task, kind, message) so the log sorts identically no
/// matter which task failed first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    pub task_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(
        stage: Stage,
        task_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            task_id: task_id.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {:?}: {}", self.stage, self.task_id, self.kind, self.message)
    }
}
