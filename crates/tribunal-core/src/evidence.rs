//! Evidence store and its mapping-union reducer.
//!
//! Evidence is namespaced by collector id and keyed by
//! `(collector_id, subject_location)`. The store only grows; a key that is
//! written twice (a collector re-run) keeps whichever entry wins the
//! precedence order below, so merging is commutative, associative and
//! idempotent.

use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Errors raised while building evidence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvidenceError {
    #[error("Malformed evidence key '{0}': expected '<collector>:<location>'")]
    MalformedKey(String),

    #[error("Collector '{collector}' wrote evidence under foreign namespace '{foreign}'")]
    ForeignNamespace { collector: String, foreign: String },
}

/// Unique key of a piece of evidence.
///
/// Its textual form, used in citations, is `collector_id:subject_location`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EvidenceKey {
    pub collector_id: String,
    pub subject_location: String,
}

impl EvidenceKey {
    pub fn new(collector_id: impl Into<String>, subject_location: impl Into<String>) -> Self {
        Self {
            collector_id: collector_id.into(),
            subject_location: subject_location.into(),
        }
    }

    /// Parse a citation of the form `collector:location`.
    ///
    /// Splits at the first `:` so locations may themselves contain colons
    /// (URLs, `file.rs:42`).
    pub fn parse(citation: &str) -> Result<Self, EvidenceError> {
        let citation = citation.trim();
        match citation.split_once(':') {
            Some((collector, location)) if !collector.trim().is_empty() && !location.is_empty() => {
                Ok(Self::new(collector.trim(), location.trim()))
            }
            _ => Err(EvidenceError::MalformedKey(citation.to_string())),
        }
    }
}

impl fmt::Display for EvidenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collector_id, self.subject_location)
    }
}

impl From<EvidenceKey> for String {
    fn from(key: EvidenceKey) -> String {
        key.to_string()
    }
}

impl TryFrom<String> for EvidenceKey {
    type Error = EvidenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EvidenceKey::parse(&value)
    }
}

/// A single finding produced by a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub collector_id: String,

    pub subject_location: String,

    /// Whether the inspected artifact exists / the check passed
    pub found: bool,

    /// Confidence in [0, 1]
    #[serde(deserialize_with = "deserialize_confidence")]
    pub confidence: f64,

    /// One-line description of the finding
    pub summary: String,

    /// Optional supporting snippet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Retry index of the collector run that produced this entry
    #[serde(default)]
    pub attempt: u32,
}

impl Evidence {
    /// Create evidence, clamping confidence into [0, 1].
    pub fn new(
        collector_id: impl Into<String>,
        subject_location: impl Into<String>,
        found: bool,
        confidence: f64,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            collector_id: collector_id.into(),
            subject_location: subject_location.into(),
            found,
            confidence: clamp_confidence(confidence),
            summary: summary.into(),
            content: None,
            attempt: 0,
        }
    }

    /// Placeholder for evidence a failed collector could not produce.
    pub fn missing(
        collector_id: impl Into<String>,
        subject_location: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(collector_id, subject_location, false, 0.0, reason)
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn key(&self) -> EvidenceKey {
        EvidenceKey::new(&self.collector_id, &self.subject_location)
    }

    /// Total precedence order used by the mapping-union reducer.
    ///
    /// Highest confidence wins, then the most recent attempt, then `found`,
    /// then the textual fields. Every component is compared, so two
    /// distinct entries never tie.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.confidence
            .total_cmp(&other.confidence)
            .then(self.attempt.cmp(&other.attempt))
            .then(self.found.cmp(&other.found))
            .then_with(|| self.summary.cmp(&other.summary))
            .then_with(|| self.content.cmp(&other.content))
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

fn deserialize_confidence<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_confidence)
}

/// Pick the surviving entry for a key collision.
fn resolve(current: Evidence, incoming: Evidence) -> Evidence {
    if incoming.precedence(&current) == Ordering::Greater {
        incoming
    } else {
        current
    }
}

/// The evidence a single collector task produced.
///
/// Each task owns its partial until the aggregate barrier merges it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePartial {
    pub collector_id: String,
    pub entries: Vec<Evidence>,
}

impl EvidencePartial {
    pub fn new(collector_id: impl Into<String>) -> Self {
        Self {
            collector_id: collector_id.into(),
            entries: Vec::new(),
        }
    }

    /// Add a finding under this collector's namespace.
    pub fn record(
        mut self,
        subject_location: impl Into<String>,
        found: bool,
        confidence: f64,
        summary: impl Into<String>,
    ) -> Self {
        let evidence = Evidence::new(&self.collector_id, subject_location, found, confidence, summary);
        self.entries.push(evidence);
        self
    }

    pub fn push(&mut self, evidence: Evidence) {
        self.entries.push(evidence);
    }

    /// Stamp every entry with the attempt index that produced it.
    pub fn stamp_attempt(mut self, attempt: u32) -> Self {
        for entry in &mut self.entries {
            entry.attempt = attempt;
        }
        self
    }

    /// Reject entries written under another collector's namespace.
    pub fn validate_namespace(&self) -> Result<(), EvidenceError> {
        match self
            .entries
            .iter()
            .find(|e| e.collector_id != self.collector_id)
        {
            Some(foreign) => Err(EvidenceError::ForeignNamespace {
                collector: self.collector_id.clone(),
                foreign: foreign.collector_id.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Found/total counts for one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectorTally {
    pub found: usize,
    pub total: usize,
}

/// Append-only, namespaced record of findings.
///
/// Deserialized stores are rebuilt through [`EvidenceStore::insert`], so
/// serialized map keys are ignored in favour of each entry's own key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "StoredEvidence")]
pub struct EvidenceStore {
    entries: BTreeMap<EvidenceKey, Evidence>,
}

#[derive(Deserialize)]
struct StoredEvidence {
    entries: BTreeMap<String, Evidence>,
}

impl From<StoredEvidence> for EvidenceStore {
    fn from(stored: StoredEvidence) -> Self {
        let mut store = EvidenceStore::new();
        for evidence in stored.entries.into_values() {
            store.insert(evidence);
        }
        store
    }
}

impl EvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from partials. Order of `partials` is irrelevant.
    pub fn from_partials<I>(partials: I) -> Self
    where
        I: IntoIterator<Item = EvidencePartial>,
    {
        let mut store = Self::new();
        for partial in partials {
            store.merge_partial(partial);
        }
        store
    }

    /// Insert one entry through the reducer.
    pub fn insert(&mut self, evidence: Evidence) {
        let key = evidence.key();
        let merged = match self.entries.remove(&key) {
            Some(current) => resolve(current, evidence),
            None => evidence,
        };
        self.entries.insert(key, merged);
    }

    /// Merge a collector's partial through the reducer.
    pub fn merge_partial(&mut self, partial: EvidencePartial) {
        for evidence in partial.entries {
            self.insert(evidence);
        }
    }

    /// Mapping-union of two stores.
    pub fn merge(mut self, other: EvidenceStore) -> EvidenceStore {
        for (_, evidence) in other.entries {
            self.insert(evidence);
        }
        self
    }

    pub fn get(&self, key: &EvidenceKey) -> Option<&Evidence> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &EvidenceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Evidence> {
        self.entries.values()
    }

    /// Evidence written by one collector, in key order.
    pub fn by_collector<'a>(&'a self, collector_id: &'a str) -> impl Iterator<Item = &'a Evidence> {
        self.entries
            .values()
            .filter(move |e| e.collector_id == collector_id)
    }

    /// Collector ids present in the store.
    pub fn collectors(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(|k| k.collector_id.as_str()).collect();
        ids.dedup();
        ids
    }

    /// A sub-store restricted to the given collectors.
    pub fn restricted_to(&self, collectors: &[&str]) -> EvidenceStore {
        let entries = self
            .entries
            .iter()
            .filter(|(k, _)| collectors.contains(&k.collector_id.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        EvidenceStore { entries }
    }

    /// Per-collector found/total counts.
    pub fn summary(&self) -> BTreeMap<String, CollectorTally> {
        let mut tallies: BTreeMap<String, CollectorTally> = BTreeMap::new();
        for evidence in self.entries.values() {
            let tally = tallies.entry(evidence.collector_id.clone()).or_default();
            tally.total += 1;
            if evidence.found {
                tally.found += 1;
            }
        }
        tallies
    }

    /// Stable content fingerprint, used as a cache key component.
    pub fn fingerprint(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        for (key, evidence) in &self.entries {
            key.hash(&mut hasher);
            evidence.found.hash(&mut hasher);
            evidence.confidence.to_bits().hash(&mut hasher);
            evidence.summary.hash(&mut hasher);
            evidence.content.hash(&mut hasher);
            evidence.attempt.hash(&mut hasher);
        }
        hasher.finish()
    }
}
