//! Opinions and the keyed-replace reducer.
//!
//! At most one opinion exists per `(criterion_id, role)`. A second write for
//! the same key replaces the first instead of accumulating, so a retried
//! evaluator task can never leave duplicate opinions behind.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::evidence::EvidenceKey;
use crate::types::{Role, Score};

/// A scored judgment from one evaluator on one criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opinion {
    pub criterion_id: String,

    pub role: Role,

    pub score: Score,

    pub rationale: String,

    /// Grounded citations, in the order the evaluator gave them
    #[serde(default)]
    pub cited_evidence: Vec<EvidenceKey>,

    /// True for the fallback sentinel emitted after coercion gave up
    #[serde(default)]
    pub degraded: bool,

    /// Elicitation attempt that produced this opinion
    #[serde(default)]
    pub attempt: u32,
}

impl Opinion {
    pub fn new(
        criterion_id: impl Into<String>,
        role: Role,
        score: Score,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            criterion_id: criterion_id.into(),
            role,
            score,
            rationale: rationale.into(),
            cited_evidence: Vec::new(),
            degraded: false,
            attempt: 0,
        }
    }

    pub fn citing(mut self, keys: impl IntoIterator<Item = EvidenceKey>) -> Self {
        self.cited_evidence.extend(keys);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn key(&self) -> OpinionKey {
        OpinionKey {
            criterion_id: self.criterion_id.clone(),
            role: self.role,
        }
    }

    /// Total precedence order used by the keyed-replace reducer.
    ///
    /// The later attempt wins; at equal attempts a genuine opinion beats a
    /// degraded one; remaining ties are broken on content.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.attempt
            .cmp(&other.attempt)
            .then((!self.degraded).cmp(&!other.degraded))
            .then(self.score.cmp(&other.score))
            .then_with(|| self.rationale.cmp(&other.rationale))
            .then_with(|| self.cited_evidence.cmp(&other.cited_evidence))
    }
}

/// Key of the opinion set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpinionKey {
    pub criterion_id: String,
    pub role: Role,
}

/// Keyed-replace collection of opinions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpinionSet {
    #[serde(with = "opinion_list")]
    opinions: BTreeMap<OpinionKey, Opinion>,
}

impl OpinionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an opinion, replacing any earlier one under the same key.
    ///
    /// Returns true when the incoming opinion became the stored one.
    pub fn insert(&mut self, opinion: Opinion) -> bool {
        let key = opinion.key();
        match self.opinions.get(&key) {
            Some(current) if opinion.precedence(current) != Ordering::Greater => false,
            _ => {
                self.opinions.insert(key, opinion);
                true
            }
        }
    }

    /// Keyed-replace union of two sets.
    pub fn merge(mut self, other: OpinionSet) -> OpinionSet {
        for (_, opinion) in other.opinions {
            self.insert(opinion);
        }
        self
    }

    pub fn get(&self, criterion_id: &str, role: Role) -> Option<&Opinion> {
        self.opinions.get(&OpinionKey {
            criterion_id: criterion_id.to_string(),
            role,
        })
    }

    pub fn contains(&self, criterion_id: &str, role: Role) -> bool {
        self.get(criterion_id, role).is_some()
    }

    /// Opinions for one criterion, in role order.
    pub fn for_criterion<'a>(&'a self, criterion_id: &'a str) -> impl Iterator<Item = &'a Opinion> {
        self.opinions
            .values()
            .filter(move |o| o.criterion_id == criterion_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Opinion> {
        self.opinions.values()
    }

    pub fn len(&self) -> usize {
        self.opinions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opinions.is_empty()
    }
}

impl FromIterator<Opinion> for OpinionSet {
    fn from_iter<I: IntoIterator<Item = Opinion>>(iter: I) -> Self {
        let mut set = OpinionSet::new();
        for opinion in iter {
            set.insert(opinion);
        }
        set
    }
}

/// Serialize the map as a plain list; keys are derivable from the values.
mod opinion_list {
    use super::{Opinion, OpinionKey};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<OpinionKey, Opinion>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let list: Vec<&Opinion> = map.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<OpinionKey, Opinion>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Vec::<Opinion>::deserialize(deserializer)?;
        let set: super::OpinionSet = list.into_iter().collect();
        Ok(set.opinions)
    }
}
