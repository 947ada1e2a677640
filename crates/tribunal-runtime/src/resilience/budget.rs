//! Token budgets for reasoning calls.
//!
//! The global budget is split into per-role allowances before evaluators
//! start, so whether a call is refused never depends on how far the other
//! roles have got. A call is refused up front when the estimated cost no
//! longer fits its role's allowance.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tribunal_core::Role;

use crate::providers::TokenUsage;

/// Token budget for one scope.
pub struct TokenBudget {
    pub max_tokens: u32,
    used: AtomicU32,
}

impl TokenBudget {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            used: AtomicU32::new(0),
        }
    }

    pub fn can_afford(&self, tokens: u32) -> bool {
        self.remaining() >= tokens
    }

    pub fn record(&self, tokens: u32) {
        self.used.fetch_add(tokens, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> u32 {
        self.max_tokens.saturating_sub(self.used.load(Ordering::SeqCst))
    }
}

/// Accumulated reasoning usage for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Reasoning calls that returned a response
    pub calls: u32,
    /// Opinions served from the cache instead of a call
    pub cache_hits: u32,
    /// Calls refused because a budget was exhausted
    pub refused_calls: u32,
}

impl LlmUsage {
    pub fn add(&mut self, usage: &TokenUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total();
        self.calls += 1;
    }
}

/// Budget split and usage counters for one run.
pub struct BudgetTracker {
    global_max: u32,
    per_role_max: u32,
    usage: RwLock<LlmUsage>,
}

impl BudgetTracker {
    pub fn new(global_max: u32, per_role_max: u32) -> Self {
        Self {
            global_max,
            per_role_max,
            usage: RwLock::new(LlmUsage::default()),
        }
    }

    /// Split the global budget into per-role allowances.
    ///
    /// `pairs` yields the role of every (criterion, role) call of the run in
    /// canonical order. Each pair is granted `estimate` tokens while the
    /// global budget lasts, then the remainder is shared evenly between the
    /// roles that have work. Allowances are capped at the per-role maximum.
    pub fn allot<I>(&self, pairs: I, estimate: u32) -> BTreeMap<Role, TokenBudget>
    where
        I: IntoIterator<Item = Role>,
    {
        let mut remaining = self.global_max;
        let mut grants: BTreeMap<Role, u32> = BTreeMap::new();
        for role in pairs {
            let grant = grants.entry(role).or_default();
            if remaining >= estimate {
                remaining -= estimate;
                *grant += estimate;
            }
        }

        let roles = grants.len() as u32;
        if roles > 0 {
            let share = remaining / roles;
            let mut extra = remaining % roles;
            for grant in grants.values_mut() {
                *grant += share;
                if extra > 0 {
                    *grant += 1;
                    extra -= 1;
                }
            }
        }

        grants
            .into_iter()
            .map(|(role, tokens)| (role, TokenBudget::new(tokens.min(self.per_role_max))))
            .collect()
    }

    pub fn record_usage(&self, usage: &TokenUsage) {
        self.usage.write().add(usage);
    }

    pub fn record_cache_hit(&self) {
        self.usage.write().cache_hits += 1;
    }

    pub fn record_refusal(&self) {
        self.usage.write().refused_calls += 1;
    }

    pub fn usage(&self) -> LlmUsage {
        self.usage.read().clone()
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new(200_000, 80_000)
    }
}
