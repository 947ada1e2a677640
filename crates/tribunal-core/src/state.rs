//! Run-wide aggregate state.
//!
//! `RunState` is passed explicitly through the pipeline. It changes only
//! through the barrier merge methods below and refuses every change once
//! frozen.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evidence::{EvidencePartial, EvidenceStore};
use crate::opinions::{Opinion, OpinionSet};
use crate::types::{ErrorKind, ErrorRecord};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Run state is frozen; no further merges are allowed")]
    Frozen,
}

/// Evidence store, opinion set and error log for one execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunState {
    evidence: EvidenceStore,
    opinions: OpinionSet,
    errors: Vec<ErrorRecord>,
    frozen: bool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        if self.frozen {
            Err(StateError::Frozen)
        } else {
            Ok(())
        }
    }

    /// Barrier merge of collector partials (mapping-union).
    pub fn merge_evidence<I>(&mut self, partials: I) -> Result<(), StateError>
    where
        I: IntoIterator<Item = EvidencePartial>,
    {
        self.ensure_open()?;
        for partial in partials {
            self.evidence.merge_partial(partial);
        }
        Ok(())
    }

    /// Barrier merge of evaluator buffers (keyed-replace).
    pub fn merge_opinions<I>(&mut self, opinions: I) -> Result<(), StateError>
    where
        I: IntoIterator<Item = Opinion>,
    {
        self.ensure_open()?;
        for opinion in opinions {
            self.opinions.insert(opinion);
        }
        Ok(())
    }

    /// Barrier merge of error records. The log stays sorted and deduplicated.
    pub fn record_errors<I>(&mut self, records: I) -> Result<(), StateError>
    where
        I: IntoIterator<Item = ErrorRecord>,
    {
        self.ensure_open()?;
        self.errors.extend(records);
        self.errors.sort();
        self.errors.dedup();
        Ok(())
    }

    /// Freeze the state. Idempotent.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn evidence(&self) -> &EvidenceStore {
        &self.evidence
    }

    pub fn opinions(&self) -> &OpinionSet {
        &self.opinions
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// Error records of one kind.
    pub fn errors_of(&self, kind: ErrorKind) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }

    /// First record that would abort a fail-fast run.
    pub fn first_unrecoverable(&self) -> Option<&ErrorRecord> {
        self.errors.iter().find(|e| e.kind.is_unrecoverable())
    }
}
