//! Synthesis engine: reconciles the opinions on one criterion into a verdict.
//!
//! Rules apply in fixed priority order:
//! 1. Evidence-override: an opinion that awards a high score while citing
//!    evidence the store marks as not found is given zero weight.
//! 2. Severity-cap: a minimal critical opinion naming a severity keyword caps
//!    the result at `cap_score`. The cap only ever lowers the score.
//! 3. Weighted average over the remaining opinions, rounded half-up.
//! 4. Variance flag: a wide spread marks the verdict for human review. It
//!    never changes the score.
//!
//! The engine is a pure function of its inputs. Input order does not matter.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

use crate::evidence::EvidenceStore;
use crate::opinions::{Opinion, OpinionSet};
use crate::rubric::{Criterion, Rubric, SynthesisPolicy};
use crate::types::{ErrorKind, ErrorRecord, Role, Score, Stage};

/// Errors constructing a synthesis engine.
#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Invalid severity keyword pattern: {0}")]
    InvalidKeywords(#[from] regex::Error),
}

/// The highest-priority rule that shaped a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleApplied {
    EvidenceOverride,
    SeverityCap,
    WeightedAverage,
}

/// One opinion quoted verbatim in a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpinionDigest {
    pub role: Role,
    pub score: Score,
    pub rationale: String,
}

impl From<&Opinion> for OpinionDigest {
    fn from(opinion: &Opinion) -> Self {
        Self {
            role: opinion.role,
            score: opinion.score,
            rationale: opinion.rationale.clone(),
        }
    }
}

/// The two extremes of a high-variance verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dissent {
    pub highest: OpinionDigest,
    pub lowest: OpinionDigest,
}

/// Final result for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub criterion_id: String,
    pub final_score: Score,
    pub rationale: String,
    /// max - min of contributing scores
    pub variance: u8,
    pub rule_applied: RuleApplied,
    pub review_required: bool,
    /// Unrounded weighted mean of the contributing scores
    pub weighted_mean: f64,
    /// Roles whose weight the evidence-override zeroed
    #[serde(default)]
    pub zeroed_roles: Vec<Role>,
    /// Roles whose contributing opinion is a degraded fallback
    #[serde(default)]
    pub degraded_roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dissent: Option<Dissent>,
}

/// Outcome for one rubric criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CriterionOutcome {
    Verdict(VerdictRecord),
    InsufficientData { criterion_id: String, reason: String },
}

impl CriterionOutcome {
    pub fn criterion_id(&self) -> &str {
        match self {
            CriterionOutcome::Verdict(v) => &v.criterion_id,
            CriterionOutcome::InsufficientData { criterion_id, .. } => criterion_id,
        }
    }

    pub fn verdict(&self) -> Option<&VerdictRecord> {
        match self {
            CriterionOutcome::Verdict(v) => Some(v),
            CriterionOutcome::InsufficientData { .. } => None,
        }
    }

    pub fn final_score(&self) -> Option<Score> {
        self.verdict().map(|v| v.final_score)
    }

    /// Error record for the run log when no verdict could be produced.
    pub fn shortage_record(&self) -> Option<ErrorRecord> {
        match self {
            CriterionOutcome::Verdict(_) => None,
            CriterionOutcome::InsufficientData { criterion_id, reason } => Some(ErrorRecord::new(
                Stage::Synthesize,
                criterion_id.clone(),
                ErrorKind::SynthesisInputShortage,
                reason.clone(),
            )),
        }
    }
}

/// Reconciles opinions into verdicts under a [`SynthesisPolicy`].
#[derive(Debug, Clone)]
pub struct SynthesisEngine {
    policy: SynthesisPolicy,
    severity: Option<Regex>,
}

impl SynthesisEngine {
    pub fn new(policy: SynthesisPolicy) -> Result<Self, SynthesisError> {
        let severity = if policy.severity_keywords.is_empty() {
            None
        } else {
            let alternatives: Vec<String> = policy
                .severity_keywords
                .iter()
                .map(|k| regex::escape(k.trim()))
                .collect();
            Some(Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))?)
        };

        Ok(Self { policy, severity })
    }

    pub fn policy(&self) -> &SynthesisPolicy {
        &self.policy
    }

    /// Synthesize every criterion of a rubric, in rubric order.
    pub fn synthesize_all(
        &self,
        rubric: &Rubric,
        opinions: &OpinionSet,
        store: &EvidenceStore,
    ) -> Vec<CriterionOutcome> {
        rubric
            .criteria
            .iter()
            .map(|criterion| self.synthesize(criterion, opinions.for_criterion(&criterion.id), store))
            .collect()
    }

    /// Synthesize one criterion.
    ///
    /// Opinions for other criteria are ignored. If two opinions share a role
    /// the keyed-replace precedence picks one, so input order never matters.
    pub fn synthesize<'a, I>(&self, criterion: &Criterion, opinions: I, store: &EvidenceStore) -> CriterionOutcome
    where
        I: IntoIterator<Item = &'a Opinion>,
    {
        let by_role = latest_by_role(&criterion.id, opinions);

        if by_role.is_empty() {
            return self.shortage(criterion, "no opinions were recorded");
        }

        // Rule 1: evidence-override
        let mut zeroed_roles = Vec::new();
        let mut contributing: Vec<(&Opinion, u64)> = Vec::new();
        for (role, opinion) in &by_role {
            let weight = criterion.weight_units(*role);
            if weight == 0 {
                continue;
            }
            if self.contradicts_store(opinion, store) {
                tracing::debug!(criterion = %criterion.id, role = %role, "Evidence override zeroed opinion");
                zeroed_roles.push(*role);
                continue;
            }
            contributing.push((opinion, weight));
        }

        if contributing.is_empty() {
            return self.shortage(criterion, "total weight of contributing opinions is zero");
        }
        if contributing.iter().all(|(o, _)| o.degraded) {
            return self.shortage(criterion, "all contributing opinions are degraded fallbacks");
        }

        // Rule 3 computed before rule 2 so the cap can compare against it
        let numerator: u64 = contributing
            .iter()
            .map(|(o, w)| u64::from(o.score.value()) * w)
            .sum();
        let denominator: u64 = contributing.iter().map(|(_, w)| w).sum();
        let weighted_mean = numerator as f64 / denominator as f64;
        let rounded = Score::clamped(((2 * numerator + denominator) / (2 * denominator)) as i64);

        let min_score = contributing.iter().map(|(o, _)| o.score).min().unwrap_or(Score::MIN);
        let max_score = contributing.iter().map(|(o, _)| o.score).max().unwrap_or(Score::MAX);

        // Rule 2: severity-cap
        let cap_trigger = contributing.iter().find(|(o, _)| {
            o.role == self.policy.critical_role
                && !o.degraded
                && o.score == min_score
                && self.names_severe_flaw(&o.rationale)
        });
        let capped = cap_trigger.is_some() && self.policy.cap_score < rounded;
        let final_score = if capped { self.policy.cap_score } else { rounded };

        // Rule 4: variance flag
        let variance = max_score.value() - min_score.value();
        let review_required = variance >= self.policy.variance_threshold;
        let dissent = review_required.then(|| dissent_of(&contributing));

        let rule_applied = if !zeroed_roles.is_empty() {
            RuleApplied::EvidenceOverride
        } else if capped {
            RuleApplied::SeverityCap
        } else {
            RuleApplied::WeightedAverage
        };

        let degraded_roles: Vec<Role> = contributing
            .iter()
            .filter(|(o, _)| o.degraded)
            .map(|(o, _)| o.role)
            .collect();

        let rationale = self.explain(
            &contributing,
            &zeroed_roles,
            weighted_mean,
            rounded,
            capped,
            variance,
            review_required,
        );

        tracing::debug!(
            criterion = %criterion.id,
            score = %final_score,
            variance,
            review_required,
            rule = ?rule_applied,
            "Criterion synthesized"
        );

        CriterionOutcome::Verdict(VerdictRecord {
            criterion_id: criterion.id.clone(),
            final_score,
            rationale,
            variance,
            rule_applied,
            review_required,
            weighted_mean,
            zeroed_roles,
            degraded_roles,
            dissent,
        })
    }

    /// A high score resting on evidence the store says is missing.
    fn contradicts_store(&self, opinion: &Opinion, store: &EvidenceStore) -> bool {
        opinion.score >= self.policy.contradiction_min_score
            && opinion
                .cited_evidence
                .iter()
                .any(|key| store.get(key).map(|e| !e.found).unwrap_or(false))
    }

    fn names_severe_flaw(&self, rationale: &str) -> bool {
        self.severity
            .as_ref()
            .map(|re| re.is_match(rationale))
            .unwrap_or(false)
    }

    fn shortage(&self, criterion: &Criterion, reason: &str) -> CriterionOutcome {
        tracing::warn!(criterion = %criterion.id, reason, "Insufficient data for verdict");
        CriterionOutcome::InsufficientData {
            criterion_id: criterion.id.clone(),
            reason: reason.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn explain(
        &self,
        contributing: &[(&Opinion, u64)],
        zeroed_roles: &[Role],
        weighted_mean: f64,
        rounded: Score,
        capped: bool,
        variance: u8,
        review_required: bool,
    ) -> String {
        let scores: Vec<String> = contributing
            .iter()
            .map(|(o, w)| format!("{}={} (w={:.2})", o.role, o.score, *w as f64 / 10_000.0))
            .collect();

        let mut text = format!(
            "Weighted average {:.2} over {} rounds to {}.",
            weighted_mean,
            scores.join(", "),
            rounded
        );

        if !zeroed_roles.is_empty() {
            let roles: Vec<&str> = zeroed_roles.iter().map(Role::as_str).collect();
            let _ = write!(
                text,
                " Evidence override: {} cited evidence marked not found and was given zero weight.",
                roles.join(", ")
            );
        }

        if capped {
            let _ = write!(
                text,
                " Severity cap: the {} opinion reports a disqualifying flaw; score capped at {}.",
                self.policy.critical_role, self.policy.cap_score
            );
        }

        if review_required {
            let _ = write!(
                text,
                " Variance {} meets the review threshold of {}; human review required.",
                variance, self.policy.variance_threshold
            );
        }

        text
    }
}

/// One opinion per role for the criterion, chosen by keyed-replace precedence.
fn latest_by_role<'a, I>(criterion_id: &str, opinions: I) -> BTreeMap<Role, &'a Opinion>
where
    I: IntoIterator<Item = &'a Opinion>,
{
    let mut by_role: BTreeMap<Role, &'a Opinion> = BTreeMap::new();
    for opinion in opinions.into_iter().filter(|o| o.criterion_id == criterion_id) {
        match by_role.get(&opinion.role) {
            Some(current) if opinion.precedence(current) != std::cmp::Ordering::Greater => {}
            _ => {
                by_role.insert(opinion.role, opinion);
            }
        }
    }
    by_role
}

/// Highest and lowest contributing opinions. Ties go to the earlier role.
fn dissent_of(contributing: &[(&Opinion, u64)]) -> Dissent {
    let mut highest = contributing[0].0;
    let mut lowest = contributing[0].0;
    for (opinion, _) in contributing.iter().skip(1) {
        if opinion.score > highest.score {
            highest = opinion;
        }
        if opinion.score < lowest.score {
            lowest = opinion;
        }
    }
    Dissent {
        highest: highest.into(),
        lowest: lowest.into(),
    }
}
