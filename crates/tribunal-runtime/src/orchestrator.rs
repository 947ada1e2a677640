//! Run orchestrator.
//!
//! A run moves through fixed stages separated by two barriers:
//! - Collect: every collector runs concurrently against the same subject
//! - Barrier 1: partials merged, hooks derive extra evidence, store snapshotted
//! - Evaluate: every evaluator scores its criteria against the snapshot
//! - Barrier 2: opinions merged, missing pairs filled (resilient mode)
//! - Synthesize and finalize
//!
//! Tasks never touch shared state. Each returns its own buffer and only the
//! barriers merge, through reducers that ignore completion order.

use backon::{BackoffBuilder, Retryable};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tribunal_core::{
    reconcile, Coercer, Criterion, CriterionOutcome, ErrorKind, ErrorRecord, Evidence,
    EvidencePartial, EvidenceStore, Opinion, Role, Rubric, RunState, Stage, Subject,
    VerdictRecord,
};

use crate::agents::{AgentError, AggregationHook, Collector, EvaluationRequest, Evaluator};
use crate::cache::{CacheKey, OpinionCache};
use crate::config::{FailMode, RuntimeConfig};
use crate::resilience::{BudgetTracker, CircuitBreaker, LlmUsage, TokenBudget};
use crate::RuntimeError;

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub subject: Subject,

    /// Name of the rubric the run was scored against
    pub rubric: String,

    /// One outcome per criterion, in rubric order
    pub outcomes: Vec<CriterionOutcome>,

    /// Frozen evidence, opinions and error log
    pub state: RunState,

    pub usage: LlmUsage,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn outcome(&self, criterion_id: &str) -> Option<&CriterionOutcome> {
        self.outcomes.iter().find(|o| o.criterion_id() == criterion_id)
    }

    /// Verdicts flagged for human review.
    pub fn review_required(&self) -> impl Iterator<Item = &VerdictRecord> {
        self.outcomes
            .iter()
            .filter_map(CriterionOutcome::verdict)
            .filter(|v| v.review_required)
    }

    /// Criteria that ended without a verdict.
    pub fn insufficient(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.verdict().is_none())
            .map(CriterionOutcome::criterion_id)
    }

    /// Mean final score over criteria with a verdict.
    pub fn overall_score(&self) -> Option<f64> {
        let scores: Vec<f64> = self
            .outcomes
            .iter()
            .filter_map(|o| o.final_score())
            .map(|s| f64::from(s.value()))
            .collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }
}

/// Result of one collector task.
struct CollectorRun {
    collector: Arc<dyn Collector>,
    result: Result<EvidencePartial, AgentError>,
}

/// Opinions and errors buffered by one evaluator task.
struct EvaluatorBuffer {
    role: Role,
    opinions: Vec<Opinion>,
    errors: Vec<ErrorRecord>,
}

impl EvaluatorBuffer {
    fn has_unrecoverable(&self) -> bool {
        self.errors.iter().any(|e| e.kind.is_unrecoverable())
    }
}

/// Read-only context shared by evaluator tasks.
struct EvaluationContext {
    evidence: Arc<EvidenceStore>,
    fingerprint: u64,
    coercer: Coercer,
    config: RuntimeConfig,
    breaker: Arc<CircuitBreaker>,
    budget: Arc<BudgetTracker>,
    cache: Option<Arc<OpinionCache>>,
}

/// Drives collectors and evaluators through the staged pipeline.
///
/// # Architecture
/// - Parallel fan-out: `JoinSet` bounded by a semaphore, one task per agent
/// - Deterministic fan-in: barrier merges through order-independent reducers
/// - Resilience: timeout, retry, circuit breaker and budget per call
/// - Failure isolation: a failed task only affects its own namespace
pub struct RunOrchestrator {
    config: RuntimeConfig,
    collectors: Vec<Arc<dyn Collector>>,
    hooks: Vec<Arc<dyn AggregationHook>>,
    evaluators: Vec<Arc<dyn Evaluator>>,
    breaker: Arc<CircuitBreaker>,
    cache: Option<Arc<OpinionCache>>,
}

impl RunOrchestrator {
    pub fn builder() -> RunOrchestratorBuilder {
        RunOrchestratorBuilder::default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    /// Execute one run of `rubric` against `subject`.
    ///
    /// # Execution Flow
    /// 1. Collect evidence in parallel
    /// 2. Barrier 1: merge, derive, snapshot
    /// 3. Evaluate criteria in parallel, one task per role
    /// 4. Barrier 2: merge opinions, fill or abort
    /// 5. Synthesize every criterion and freeze the state
    pub async fn run(&self, rubric: &Rubric, subject: &Subject) -> Result<RunReport, RuntimeError> {
        let started_at = Utc::now();
        let subject = Arc::new(subject.clone());
        let budget = Arc::new(BudgetTracker::new(
            self.config.budgets.global_max_tokens,
            self.config.budgets.per_role_max_tokens,
        ));
        let coercer = Coercer::new(rubric.coercion.clone());
        let mut state = RunState::new();

        tracing::info!(
            rubric = %rubric.name,
            subject = %subject.name,
            collectors = self.collectors.len(),
            evaluators = self.evaluators.len(),
            mode = ?self.config.fail_mode,
            "Starting run"
        );

        let runs = self.collect(&subject).await;
        self.aggregate(&subject, runs, &mut state)?;
        let evidence = Arc::new(state.evidence().clone());

        let buffers = self
            .evaluate(rubric, evidence, coercer.clone(), Arc::clone(&budget))
            .await;
        self.reconcile_opinions(rubric, buffers, &coercer, &mut state)?;

        let outcomes = reconcile(rubric, &mut state)?;
        let usage = budget.usage();

        tracing::info!(
            verdicts = outcomes.iter().filter(|o| o.verdict().is_some()).count(),
            insufficient = outcomes.iter().filter(|o| o.verdict().is_none()).count(),
            errors = state.errors().len(),
            tokens = usage.total_tokens,
            "Run finished"
        );

        Ok(RunReport {
            subject: (*subject).clone(),
            rubric: rubric.name.clone(),
            outcomes,
            state,
            usage,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn fail_fast(&self) -> bool {
        self.config.fail_mode == FailMode::FailFast
    }

    /// Collect stage. In fail-fast mode the first failure cancels the rest.
    async fn collect(&self, subject: &Arc<Subject>) -> Vec<CollectorRun> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks = JoinSet::new();

        for collector in &self.collectors {
            let collector = Arc::clone(collector);
            let subject = Arc::clone(subject);
            let semaphore = Arc::clone(&semaphore);
            let config = self.config.clone();

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => AssertUnwindSafe(run_collector(&*collector, &subject, &config))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(AgentError::Internal("collector task panicked".to_string()))
                        }),
                    Err(closed) => Err(AgentError::Internal(closed.to_string())),
                };
                CollectorRun { collector, result }
            });
        }

        let mut runs = Vec::with_capacity(self.collectors.len());
        while let Some(joined) = tasks.join_next().await {
            let run = match joined {
                Ok(run) => run,
                Err(e) => {
                    tracing::error!(error = %e, "Collector task did not complete");
                    continue;
                }
            };
            let failed = run.result.is_err();
            runs.push(run);
            if failed && self.fail_fast() {
                tasks.abort_all();
                break;
            }
        }
        runs
    }

    /// Barrier 1.
    fn aggregate(
        &self,
        subject: &Subject,
        runs: Vec<CollectorRun>,
        state: &mut RunState,
    ) -> Result<(), RuntimeError> {
        let mut partials = Vec::with_capacity(runs.len());
        let mut failures = Vec::new();

        for run in runs {
            match run.result {
                Ok(partial) => {
                    tracing::debug!(collector = %run.collector.id(), entries = partial.len(), "Collector finished");
                    partials.push(partial);
                }
                Err(err) => {
                    tracing::warn!(collector = %run.collector.id(), error = %err, "Collector failed");
                    if !self.fail_fast() {
                        partials.push(placeholder(&*run.collector, subject, &err));
                    }
                    failures.push(ErrorRecord::new(
                        Stage::Collect,
                        run.collector.id(),
                        ErrorKind::CollectorFailure,
                        err.to_string(),
                    ));
                }
            }
        }

        state.merge_evidence(partials)?;
        state.record_errors(failures)?;
        self.abort_if_failed(Stage::Aggregate, state)?;

        let mut derived = Vec::with_capacity(self.hooks.len());
        let mut hook_errors = Vec::new();
        for hook in &self.hooks {
            let partial = hook.derive(state.evidence());
            match check_namespace(hook.id(), &partial) {
                Ok(()) => derived.push(partial),
                Err(err) => {
                    tracing::warn!(hook = %hook.id(), error = %err, "Aggregation hook rejected");
                    hook_errors.push(ErrorRecord::new(
                        Stage::Aggregate,
                        hook.id(),
                        ErrorKind::CollectorFailure,
                        err.to_string(),
                    ));
                }
            }
        }
        state.merge_evidence(derived)?;
        state.record_errors(hook_errors)?;
        self.abort_if_failed(Stage::Aggregate, state)?;

        for (collector, tally) in state.evidence().summary() {
            tracing::info!(
                collector = %collector,
                found = tally.found,
                total = tally.total,
                "Evidence aggregated"
            );
        }
        Ok(())
    }

    /// Evaluate stage.
    ///
    /// Token allowances are fixed per role before any task starts, walking
    /// criteria in rubric order and roles in [`Role::ALL`] order.
    async fn evaluate(
        &self,
        rubric: &Rubric,
        evidence: Arc<EvidenceStore>,
        coercer: Coercer,
        budget: Arc<BudgetTracker>,
    ) -> Vec<EvaluatorBuffer> {
        let ctx = Arc::new(EvaluationContext {
            fingerprint: evidence.fingerprint(),
            evidence,
            coercer,
            config: self.config.clone(),
            breaker: Arc::clone(&self.breaker),
            budget,
            cache: self.cache.clone(),
        });
        let assigned: Vec<(Arc<dyn Evaluator>, Vec<EvaluationRequest>)> = self
            .evaluators
            .iter()
            .map(|e| (Arc::clone(e), self.assignments(rubric, &**e, &ctx.evidence)))
            .filter(|(_, requests)| !requests.is_empty())
            .collect();

        let scored = &assigned;
        let pairs = rubric.criteria.iter().flat_map(move |criterion| {
            Role::ALL.into_iter().filter(move |role| {
                scored.iter().any(|(e, requests)| {
                    e.role() == *role && requests.iter().any(|r| r.criterion.id == criterion.id)
                })
            })
        });
        let mut allowances = ctx
            .budget
            .allot(pairs, self.config.budgets.estimated_tokens_per_call);

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks = JoinSet::new();

        for (evaluator, requests) in assigned {
            let allowance = allowances
                .remove(&evaluator.role())
                .unwrap_or_else(|| TokenBudget::new(0));
            let ctx = Arc::clone(&ctx);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let role = evaluator.role();
                let panicked = |message: String| EvaluatorBuffer {
                    role,
                    opinions: Vec::new(),
                    errors: vec![ErrorRecord::new(
                        Stage::Evaluate,
                        role.to_string(),
                        ErrorKind::EvaluatorFailure,
                        message,
                    )],
                };
                match semaphore.acquire_owned().await {
                    Ok(_permit) => AssertUnwindSafe(run_evaluator(&ctx, &*evaluator, requests, &allowance))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| panicked("evaluator task panicked".to_string())),
                    Err(closed) => panicked(closed.to_string()),
                }
            });
        }

        let mut buffers = Vec::with_capacity(self.evaluators.len());
        while let Some(joined) = tasks.join_next().await {
            let buffer = match joined {
                Ok(buffer) => buffer,
                Err(e) => {
                    tracing::error!(error = %e, "Evaluator task did not complete");
                    continue;
                }
            };
            tracing::debug!(
                role = %buffer.role,
                opinions = buffer.opinions.len(),
                errors = buffer.errors.len(),
                "Evaluator finished"
            );
            let failed = buffer.has_unrecoverable();
            buffers.push(buffer);
            if failed && self.fail_fast() {
                tasks.abort_all();
                break;
            }
        }
        buffers
    }

    /// Barrier 2.
    fn reconcile_opinions(
        &self,
        rubric: &Rubric,
        buffers: Vec<EvaluatorBuffer>,
        coercer: &Coercer,
        state: &mut RunState,
    ) -> Result<(), RuntimeError> {
        let mut opinions = Vec::new();
        let mut errors = Vec::new();
        for buffer in buffers {
            opinions.extend(buffer.opinions);
            errors.extend(buffer.errors);
        }
        state.merge_opinions(opinions)?;
        state.record_errors(errors)?;
        self.abort_if_failed(Stage::Reconcile, state)?;

        let mut sentinels = Vec::new();
        for criterion in &rubric.criteria {
            for role in criterion.weighted_roles() {
                if !state.opinions().contains(&criterion.id, role) {
                    let reason = missing_reason(state, &criterion.id, role);
                    sentinels.push(coercer.degraded_sentinel(&criterion.id, role, &reason, 0));
                }
            }
        }
        if !sentinels.is_empty() {
            tracing::warn!(count = sentinels.len(), "Filling missing opinions with degraded sentinels");
        }
        state.merge_opinions(sentinels)?;
        Ok(())
    }

    /// In fail-fast mode, turn the first unrecoverable error into an abort.
    fn abort_if_failed(&self, stage: Stage, state: &mut RunState) -> Result<(), RuntimeError> {
        if !self.fail_fast() {
            return Ok(());
        }
        let Some(cause) = state.first_unrecoverable().cloned() else {
            return Ok(());
        };

        tracing::error!(stage = %stage, cause = %cause, "Aborting run");
        let mut partial = std::mem::take(state);
        partial.freeze();
        Err(RuntimeError::Aborted {
            stage,
            cause,
            partial: Box::new(partial),
        })
    }

    /// Requests for the criteria an evaluator scores.
    ///
    /// Criteria where the role carries no weight are skipped.
    fn assignments(
        &self,
        rubric: &Rubric,
        evaluator: &dyn Evaluator,
        evidence: &Arc<EvidenceStore>,
    ) -> Vec<EvaluationRequest> {
        let role = evaluator.role();
        let only = evaluator.criteria();

        rubric
            .criteria
            .iter()
            .filter(|c| c.weight_units(role) > 0)
            .filter(|c| only.as_ref().map_or(true, |ids| ids.contains(&c.id)))
            .map(|c| EvaluationRequest {
                criterion: c.clone(),
                evidence: Arc::clone(evidence),
                judicial_logic: c.judicial_logic.get(&role).cloned(),
                relevant_collectors: self.relevant_collectors(c),
                min_rationale_len: rubric.coercion.min_rationale_len,
                feedback: None,
                attempt: 0,
            })
            .collect()
    }

    /// Collectors targeting the criterion's artifact, plus every hook.
    fn relevant_collectors(&self, criterion: &Criterion) -> Option<Vec<String>> {
        let target = criterion.target_artifact.as_deref()?;
        let mut ids: Vec<String> = self
            .collectors
            .iter()
            .filter(|c| c.target() == Some(target))
            .map(|c| c.id().to_string())
            .collect();
        if ids.is_empty() {
            return None;
        }
        ids.extend(self.hooks.iter().map(|h| h.id().to_string()));
        ids.sort();
        Some(ids)
    }
}

/// One collector with timeout and retries. Each attempt stamps its index.
async fn run_collector(
    collector: &dyn Collector,
    subject: &Subject,
    config: &RuntimeConfig,
) -> Result<EvidencePartial, AgentError> {
    let timeout = config.collector_timeout;
    let mut attempt = 0u32;

    let fetch = || {
        let current = attempt;
        attempt += 1;
        async move {
            let partial = tokio::time::timeout(timeout, collector.collect(subject))
                .await
                .map_err(|_| AgentError::Timeout(timeout))??;
            check_namespace(collector.id(), &partial)?;
            Ok::<_, AgentError>(partial.stamp_attempt(current))
        }
    };

    fetch
        .retry(config.retry.backoff(config.collector_retries))
        .when(AgentError::is_retryable)
        .notify(|err, delay| {
            tracing::warn!(
                collector = %collector.id(),
                error = %err,
                delay = ?delay,
                "Retrying collector"
            );
        })
        .await
}

fn check_namespace(expected: &str, partial: &EvidencePartial) -> Result<(), AgentError> {
    if partial.collector_id != expected {
        return Err(AgentError::ContractViolation(format!(
            "'{}' returned a partial for '{}'",
            expected, partial.collector_id
        )));
    }
    partial
        .validate_namespace()
        .map_err(|e| AgentError::ContractViolation(e.to_string()))
}

/// `found=false, confidence=0` entries standing in for a failed collector.
fn placeholder(collector: &dyn Collector, subject: &Subject, err: &AgentError) -> EvidencePartial {
    let mut locations = collector.expected_locations(subject);
    if locations.is_empty() {
        locations.push(subject.location_of(collector.target()).to_string());
    }

    let mut partial = EvidencePartial::new(collector.id());
    for location in locations {
        partial.push(Evidence::missing(
            collector.id(),
            location,
            format!("collector failed: {}", err),
        ));
    }
    partial
}

async fn run_evaluator(
    ctx: &EvaluationContext,
    evaluator: &dyn Evaluator,
    requests: Vec<EvaluationRequest>,
    allowance: &TokenBudget,
) -> EvaluatorBuffer {
    let mut buffer = EvaluatorBuffer {
        role: evaluator.role(),
        opinions: Vec::new(),
        errors: Vec::new(),
    };

    for request in requests {
        let (opinion, errors) = evaluate_criterion(ctx, evaluator, request, allowance).await;
        buffer.opinions.extend(opinion);
        buffer.errors.extend(errors);
        if ctx.config.fail_mode == FailMode::FailFast && buffer.has_unrecoverable() {
            break;
        }
    }
    buffer
}

/// Score one criterion: cache, guards, call, coerce, re-elicit.
async fn evaluate_criterion(
    ctx: &EvaluationContext,
    evaluator: &dyn Evaluator,
    mut request: EvaluationRequest,
    allowance: &TokenBudget,
) -> (Option<Opinion>, Vec<ErrorRecord>) {
    let role = evaluator.role();
    let task_id = format!("{}/{}", role, request.criterion.id);
    let failure = |kind: ErrorKind, message: String| {
        ErrorRecord::new(Stage::Evaluate, task_id.clone(), kind, message)
    };

    let cache_key = ctx
        .cache
        .as_ref()
        .map(|_| CacheKey::new(&request, role, ctx.fingerprint, ctx.coercer.policy()));
    if let (Some(cache), Some(key)) = (&ctx.cache, &cache_key) {
        if let Some(hit) = cache.get(key).await {
            tracing::debug!(role = %role, criterion = %request.criterion.id, "Opinion served from cache");
            ctx.budget.record_cache_hit();
            return (Some(hit.opinion), hit.violations);
        }
    }

    let mut delays = ctx.config.retry.backoff(ctx.config.coercion_retries).build();
    let timeout = ctx.config.evaluator_timeout;

    loop {
        if ctx.breaker.is_open(role) {
            tracing::warn!(role = %role, criterion = %request.criterion.id, "Circuit open, skipping call");
            return (
                None,
                vec![failure(ErrorKind::EvaluatorFailure, AgentError::CircuitOpen(role).to_string())],
            );
        }

        if !allowance.can_afford(ctx.config.budgets.estimated_tokens_per_call) {
            tracing::warn!(role = %role, criterion = %request.criterion.id, "Budget exhausted, skipping call");
            ctx.budget.record_refusal();
            return (
                None,
                vec![failure(ErrorKind::EvaluatorFailure, AgentError::BudgetExceeded(role).to_string())],
            );
        }

        let elicitation = match tokio::time::timeout(timeout, evaluator.evaluate(&request)).await {
            Ok(Ok(elicitation)) => {
                ctx.breaker.record_success(role);
                elicitation
            }
            Ok(Err(err)) => {
                tracing::warn!(role = %role, criterion = %request.criterion.id, error = %err, "Evaluator call failed");
                ctx.breaker.record_failure(role);
                return (None, vec![failure(ErrorKind::EvaluatorFailure, err.to_string())]);
            }
            Err(_) => {
                tracing::warn!(role = %role, criterion = %request.criterion.id, timeout = ?timeout, "Evaluator call timed out");
                ctx.breaker.record_failure(role);
                return (
                    None,
                    vec![failure(ErrorKind::EvaluatorFailure, AgentError::Timeout(timeout).to_string())],
                );
            }
        };
        allowance.record(elicitation.usage.total());
        ctx.budget.record_usage(&elicitation.usage);

        let rejection = match ctx.coercer.coerce(
            &elicitation.output,
            &request.criterion,
            role,
            &ctx.evidence,
            request.attempt,
        ) {
            Ok(coerced) => {
                if let (Some(cache), Some(key)) = (&ctx.cache, &cache_key) {
                    cache.insert(key.clone(), coerced.clone()).await;
                }
                return (Some(coerced.opinion), coerced.violations);
            }
            Err(rejection) => rejection,
        };

        tracing::warn!(
            role = %role,
            criterion = %request.criterion.id,
            attempt = request.attempt,
            reason = %rejection,
            "Evaluator output rejected"
        );

        match delays.next() {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                request.feedback = Some(rejection.feedback());
                request.attempt += 1;
            }
            None => {
                let sentinel = ctx.coercer.degraded_sentinel(
                    &request.criterion.id,
                    role,
                    &rejection.to_string(),
                    request.attempt,
                );
                let record = failure(
                    ErrorKind::SchemaValidationFailure,
                    format!("output invalid after {} attempts: {}", request.attempt + 1, rejection),
                );
                return (Some(sentinel), vec![record]);
            }
        }
    }
}

/// Why a weighted (criterion, role) pair ended without an opinion.
fn missing_reason(state: &RunState, criterion_id: &str, role: Role) -> String {
    let task_id = format!("{}/{}", role, criterion_id);
    let role_id = role.to_string();
    state
        .errors()
        .iter()
        .filter(|r| r.kind.is_unrecoverable())
        .find(|r| r.task_id == task_id || r.task_id == role_id)
        .map(|r| r.message.clone())
        .unwrap_or_else(|| format!("no {} evaluator scored this criterion", role))
}

/// Builder for [`RunOrchestrator`].
#[derive(Default)]
pub struct RunOrchestratorBuilder {
    config: RuntimeConfig,
    collectors: Vec<Arc<dyn Collector>>,
    hooks: Vec<Arc<dyn AggregationHook>>,
    evaluators: Vec<Arc<dyn Evaluator>>,
}

impl RunOrchestratorBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn AggregationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    pub fn evaluators(mut self, evaluators: impl IntoIterator<Item = Arc<dyn Evaluator>>) -> Self {
        self.evaluators.extend(evaluators);
        self
    }

    /// Validate and build.
    ///
    /// Rejects an invalid config, two evaluators for one role, and evidence
    /// namespaces (collector or hook ids) that are blank or registered twice.
    pub fn build(self) -> Result<RunOrchestrator, RuntimeError> {
        self.config.validate()?;

        let mut roles = BTreeSet::new();
        for evaluator in &self.evaluators {
            if !roles.insert(evaluator.role()) {
                return Err(RuntimeError::Configuration(format!(
                    "more than one evaluator registered for role '{}'",
                    evaluator.role()
                )));
            }
        }

        let mut namespaces = BTreeSet::new();
        let ids = self
            .collectors
            .iter()
            .map(|c| c.id())
            .chain(self.hooks.iter().map(|h| h.id()));
        for id in ids {
            if id.trim().is_empty() || id.contains(':') {
                return Err(RuntimeError::Configuration(format!(
                    "invalid evidence namespace '{}'",
                    id
                )));
            }
            if !namespaces.insert(id.to_string()) {
                return Err(RuntimeError::Configuration(format!(
                    "evidence namespace '{}' registered twice",
                    id
                )));
            }
        }

        let breaker = Arc::new(CircuitBreaker::new(self.config.circuit_breaker.clone()));
        let cache = self
            .config
            .cache
            .enabled
            .then(|| Arc::new(OpinionCache::from_config(&self.config.cache)));

        Ok(RunOrchestrator {
            config: self.config,
            collectors: self.collectors,
            hooks: self.hooks,
            evaluators: self.evaluators,
            breaker,
            cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Elicitation;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tribunal_core::{EvidenceKey, RawOutput};

    const RUBRIC: &str = r#"
rubric_version: "1.0"
name: "Audit"
criteria:
  - id: "graph"
    name: "Graph orchestration"
    target_artifact: "repository"
    judicial_logic:
      critical: "Charge linear pipelines."
  - id: "report"
    name: "Report accuracy"
    target_artifact: "report"
coercion:
  min_rationale_len: 20
"#;

    fn rubric() -> Rubric {
        Rubric::from_yaml(RUBRIC).unwrap()
    }

    fn subject() -> Subject {
        Subject::new("week2")
            .with_artifact("repository", "./submission")
            .with_artifact("report", "./report.pdf")
    }

    struct MockCollector {
        id: String,
        target: Option<String>,
        findings: Vec<(&'static str, bool)>,
        delay: Duration,
        fail_first: u32,
        foreign: bool,
        calls: AtomicU32,
        completed: AtomicU32,
    }

    impl MockCollector {
        fn new(id: &str, target: &str, findings: Vec<(&'static str, bool)>) -> Self {
            Self {
                id: id.to_string(),
                target: Some(target.to_string()),
                findings,
                delay: Duration::from_millis(10),
                fail_first: 0,
                foreign: false,
                calls: AtomicU32::new(0),
                completed: AtomicU32::new(0),
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Collector for MockCollector {
        fn id(&self) -> &str {
            &self.id
        }

        fn target(&self) -> Option<&str> {
            self.target.as_deref()
        }

        async fn collect(&self, _subject: &Subject) -> Result<EvidencePartial, AgentError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(AgentError::Collection("transient failure".to_string()));
            }

            let mut partial = EvidencePartial::new(&self.id);
            let namespace = if self.foreign { "intruder" } else { self.id.as_str() };
            for (location, found) in &self.findings {
                partial.push(Evidence::new(namespace, *location, *found, 0.9, "inspected"));
            }
            Ok(partial)
        }
    }

    type Respond = dyn Fn(&EvaluationRequest) -> Result<RawOutput, AgentError> + Send + Sync;

    struct MockEvaluator {
        role: Role,
        delay: Duration,
        cost: u32,
        respond: Box<Respond>,
        calls: AtomicU32,
        completed: AtomicU32,
        seen: Mutex<Vec<(String, u32, Option<String>)>>,
    }

    impl MockEvaluator {
        fn new(
            role: Role,
            respond: impl Fn(&EvaluationRequest) -> Result<RawOutput, AgentError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                role,
                delay: Duration::from_millis(5),
                cost: 0,
                respond: Box::new(respond),
                calls: AtomicU32::new(0),
                completed: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn scoring(role: Role, score: u8) -> Self {
            Self::new(role, move |req| Ok(opinion_json(req, score, &[])))
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Every call reports `tokens` prompt tokens.
        fn costing(mut self, tokens: u32) -> Self {
            self.cost = tokens;
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn completed(&self) -> u32 {
            self.completed.load(Ordering::SeqCst)
        }
    }

    fn opinion_json(req: &EvaluationRequest, score: u8, cites: &[&str]) -> RawOutput {
        RawOutput::Structured(json!({
            "criterion_id": req.criterion.id,
            "score": score,
            "rationale": format!("Reviewed every listed finding for {}.", req.criterion.name),
            "cited_evidence": cites,
        }))
    }

    #[async_trait]
    impl Evaluator for MockEvaluator {
        fn role(&self) -> Role {
            self.role
        }

        async fn evaluate(&self, request: &EvaluationRequest) -> Result<Elicitation, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push((
                request.criterion.id.clone(),
                request.attempt,
                request.feedback.clone(),
            ));
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            let mut elicitation = Elicitation::free((self.respond)(request)?);
            elicitation.usage.prompt_tokens = self.cost;
            Ok(elicitation)
        }
    }

    struct CrossReference;

    impl AggregationHook for CrossReference {
        fn id(&self) -> &str {
            "crossref"
        }

        fn derive(&self, store: &EvidenceStore) -> EvidencePartial {
            let backed = store.by_collector("repo").any(|e| e.found);
            EvidencePartial::new("crossref").record(
                "report-claims",
                backed,
                0.8,
                "report claims checked against repository",
            )
        }
    }

    fn no_cache() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.cache.enabled = false;
        config
    }

    fn standard(config: RuntimeConfig) -> RunOrchestratorBuilder {
        RunOrchestrator::builder()
            .config(config)
            .collector(Arc::new(MockCollector::new(
                "repo",
                "repository",
                vec![("src/graph.rs", true), ("src/state.rs", true)],
            )))
            .collector(Arc::new(MockCollector::new("docs", "report", vec![("report.pdf", true)])))
    }

    fn default_evaluators(builder: RunOrchestratorBuilder) -> RunOrchestratorBuilder {
        builder
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Critical, 2)))
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Supportive, 4)))
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Pragmatic, 4)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_produces_verdicts() {
        let orchestrator = default_evaluators(standard(no_cache())).build().unwrap();
        assert!(orchestrator.config().fail_mode == FailMode::Resilient);
        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();

        assert_eq!(report.rubric, "Audit");
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].criterion_id(), "graph");
        // (2*0.25 + 4*0.25 + 4*0.5) = 3.5, rounded half-up
        assert_eq!(report.outcomes[0].final_score().unwrap().value(), 4);
        assert_eq!(report.overall_score(), Some(4.0));
        assert_eq!(report.insufficient().count(), 0);

        assert!(report.state.is_frozen());
        assert!(report.state.errors().is_empty());
        assert_eq!(report.state.evidence().len(), 3);
        assert_eq!(report.state.opinions().len(), 6);
        assert_eq!(report.usage.calls, 6);
        assert!(report.finished_at >= report.started_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_timeout_resilient_places_placeholder() {
        let slow = Arc::new(
            MockCollector::new("docs", "report", vec![("report.pdf", true)])
                .delayed(Duration::from_secs(120)),
        );
        let orchestrator = default_evaluators(
            RunOrchestrator::builder()
                .config(no_cache())
                .collector(Arc::new(MockCollector::new("repo", "repository", vec![("src/graph.rs", true)])))
                .collector(slow.clone()),
        )
        .build()
        .unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();

        // one retry after the first timeout
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);

        let placeholder = report
            .state
            .evidence()
            .get(&EvidenceKey::new("docs", "./report.pdf"))
            .unwrap();
        assert!(!placeholder.found);
        assert_eq!(placeholder.confidence, 0.0);

        let failures: Vec<_> = report.state.errors_of(ErrorKind::CollectorFailure).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task_id, "docs");
        assert_eq!(report.outcomes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_timeout_fail_fast_aborts_with_partial_state() {
        let config = no_cache().fail_fast();
        let critical = Arc::new(MockEvaluator::scoring(Role::Critical, 3));
        let orchestrator = RunOrchestrator::builder()
            .config(config)
            .collector(Arc::new(MockCollector::new("repo", "repository", vec![("src/graph.rs", true)])))
            .collector(Arc::new(
                MockCollector::new("docs", "report", vec![]).delayed(Duration::from_secs(120)),
            ))
            .evaluator(critical.clone())
            .build()
            .unwrap();

        let err = orchestrator.run(&rubric(), &subject()).await.unwrap_err();
        match err {
            RuntimeError::Aborted { stage, cause, partial } => {
                assert_eq!(stage, Stage::Aggregate);
                assert_eq!(cause.kind, ErrorKind::CollectorFailure);
                assert_eq!(cause.task_id, "docs");
                assert!(partial.is_frozen());
                assert!(partial.evidence().contains(&EvidenceKey::new("repo", "src/graph.rs")));
                assert!(partial.opinions().is_empty());
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(critical.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_collector_stamps_attempt() {
        let mut flaky = MockCollector::new("repo", "repository", vec![("src/graph.rs", true)]);
        flaky.fail_first = 1;
        let orchestrator = default_evaluators(
            RunOrchestrator::builder().config(no_cache()).collector(Arc::new(flaky)),
        )
        .build()
        .unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();
        let evidence = report
            .state
            .evidence()
            .get(&EvidenceKey::new("repo", "src/graph.rs"))
            .unwrap();
        assert_eq!(evidence.attempt, 1);
        assert!(evidence.found);
        assert_eq!(report.state.errors_of(ErrorKind::CollectorFailure).count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_namespace_is_not_retried() {
        let mut rogue = MockCollector::new("repo", "repository", vec![("src/graph.rs", true)]);
        rogue.foreign = true;
        let rogue = Arc::new(rogue);
        let orchestrator = default_evaluators(
            RunOrchestrator::builder().config(no_cache()).collector(rogue.clone()),
        )
        .build()
        .unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();
        assert_eq!(rogue.calls.load(Ordering::SeqCst), 1);
        assert!(!report
            .state
            .evidence()
            .contains(&EvidenceKey::new("intruder", "src/graph.rs")));
        let failure = report.state.errors_of(ErrorKind::CollectorFailure).next().unwrap();
        assert!(failure.message.contains("Contract violation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_order_does_not_change_result() {
        let build = |slow_first: bool| {
            let (a, b) = if slow_first { (40, 5) } else { (5, 40) };
            RunOrchestrator::builder()
                .config(no_cache())
                .collector(Arc::new(
                    MockCollector::new("repo", "repository", vec![("src/graph.rs", true)])
                        .delayed(Duration::from_millis(a)),
                ))
                .collector(Arc::new(
                    MockCollector::new("docs", "report", vec![("report.pdf", false)])
                        .delayed(Duration::from_millis(b)),
                ))
                .evaluator(Arc::new(MockEvaluator::scoring(Role::Critical, 1).delayed(Duration::from_millis(a))))
                .evaluator(Arc::new(MockEvaluator::new(Role::Supportive, |req| {
                    Ok(opinion_json(req, 5, &["docs:report.pdf", "repo:src/ghost.rs"]))
                })))
                .evaluator(Arc::new(MockEvaluator::scoring(Role::Pragmatic, 4).delayed(Duration::from_millis(b))))
                .build()
                .unwrap()
        };

        let first = build(true).run(&rubric(), &subject()).await.unwrap();
        let second = build(false).run(&rubric(), &subject()).await.unwrap();

        assert_eq!(first.state, second.state);
        assert_eq!(first.outcomes, second.outcomes);
        assert_eq!(first.usage, second.usage);

        // supportive cited not-found evidence with a 5, so its weight was zeroed
        let report = first.outcome("report").unwrap().verdict().unwrap();
        assert_eq!(report.zeroed_roles, vec![Role::Supportive]);
        assert_eq!(first.state.errors_of(ErrorKind::GroundingViolation).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_after_failed_reelicitations() {
        let critical = Arc::new(MockEvaluator::new(Role::Critical, |_| {
            Ok(RawOutput::Text("looks fine to me".to_string()))
        }));
        let orchestrator = RunOrchestrator::builder()
            .config(no_cache())
            .collector(Arc::new(MockCollector::new("repo", "repository", vec![("src/graph.rs", true)])))
            .evaluator(critical.clone())
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Supportive, 4)))
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Pragmatic, 4)))
            .build()
            .unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();

        // 1 call + 2 re-elicitations per criterion
        assert_eq!(critical.calls(), 6);
        let seen = critical.seen.lock();
        let graph: Vec<_> = seen.iter().filter(|(c, _, _)| c == "graph").collect();
        assert_eq!(graph.iter().map(|(_, a, _)| *a).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(graph[0].2.is_none());
        assert!(graph[1].2.as_deref().unwrap().contains("rejected"));

        let opinion = report.state.opinions().get("graph", Role::Critical).unwrap();
        assert!(opinion.degraded);
        assert_eq!(opinion.score.value(), 3);
        assert_eq!(opinion.attempt, 2);
        assert!(opinion.cited_evidence.is_empty());

        let failures: Vec<_> = report
            .state
            .errors_of(ErrorKind::SchemaValidationFailure)
            .map(|r| r.task_id.as_str())
            .collect();
        assert_eq!(failures, vec!["critical/graph", "critical/report"]);

        let verdict = report.outcome("graph").unwrap().verdict().unwrap();
        assert_eq!(verdict.degraded_roles, vec![Role::Critical]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reelicitation_recovers() {
        let pragmatic = Arc::new(MockEvaluator::new(Role::Pragmatic, |req| {
            if req.attempt == 0 {
                Ok(RawOutput::Structured(json!({"score": 4, "rationale": "ok", "cited_evidence": []})))
            } else {
                Ok(opinion_json(req, 4, &["repo:src/graph.rs"]))
            }
        }));
        let orchestrator = RunOrchestrator::builder()
            .config(no_cache())
            .collector(Arc::new(MockCollector::new("repo", "repository", vec![("src/graph.rs", true)])))
            .evaluator(pragmatic.clone())
            .build()
            .unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();
        let opinion = report.state.opinions().get("graph", Role::Pragmatic).unwrap();
        assert!(!opinion.degraded);
        assert_eq!(opinion.attempt, 1);
        assert_eq!(opinion.cited_evidence, vec![EvidenceKey::new("repo", "src/graph.rs")]);
        assert_eq!(report.state.errors_of(ErrorKind::SchemaValidationFailure).count(), 0);
        assert_eq!(pragmatic.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_roles_filled_with_sentinels() {
        let orchestrator = standard(no_cache())
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Pragmatic, 5)))
            .build()
            .unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();
        let verdict = report.outcome("graph").unwrap().verdict().unwrap();
        assert_eq!(verdict.degraded_roles, vec![Role::Critical, Role::Supportive]);
        assert!(report
            .state
            .opinions()
            .get("graph", Role::Critical)
            .unwrap()
            .rationale
            .contains("no critical evaluator"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failures_yield_insufficient_data() {
        let failing = |role| {
            Arc::new(MockEvaluator::new(role, |_| {
                Err(AgentError::Internal("model unavailable".to_string()))
            }))
        };
        let orchestrator = standard(no_cache())
            .evaluator(failing(Role::Critical))
            .evaluator(failing(Role::Supportive))
            .evaluator(failing(Role::Pragmatic))
            .build()
            .unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();
        assert_eq!(report.insufficient().collect::<Vec<_>>(), vec!["graph", "report"]);
        assert_eq!(report.state.errors_of(ErrorKind::SynthesisInputShortage).count(), 2);
        assert_eq!(report.state.errors_of(ErrorKind::EvaluatorFailure).count(), 6);
        assert_eq!(report.overall_score(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluator_failure_fail_fast_aborts() {
        let orchestrator = standard(no_cache().fail_fast())
            .evaluator(Arc::new(MockEvaluator::new(Role::Critical, |_| {
                Err(AgentError::Internal("model unavailable".to_string()))
            })))
            .build()
            .unwrap();

        let err = orchestrator.run(&rubric(), &subject()).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Aborted { stage: Stage::Reconcile, ref cause, .. }
                if cause.kind == ErrorKind::EvaluatorFailure
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_stops_calls() {
        let mut config = no_cache();
        config.circuit_breaker.failure_threshold = 1;
        let pragmatic = Arc::new(MockEvaluator::new(Role::Pragmatic, |_| {
            Err(AgentError::Internal("boom".to_string()))
        }));
        let orchestrator = standard(config).evaluator(pragmatic.clone()).build().unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();
        assert_eq!(pragmatic.calls(), 1);
        let messages: Vec<_> = report
            .state
            .errors_of(ErrorKind::EvaluatorFailure)
            .map(|r| r.message.as_str())
            .collect();
        assert!(messages.iter().any(|m| m.contains("Circuit open for pragmatic")));
        assert!(orchestrator.circuit_breaker().is_open(Role::Pragmatic));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_serves_repeat_runs() {
        let critical = Arc::new(MockEvaluator::scoring(Role::Critical, 2));
        let orchestrator = standard(RuntimeConfig::default())
            .evaluator(critical.clone())
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Supportive, 4)))
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Pragmatic, 4)))
            .build()
            .unwrap();

        let first = orchestrator.run(&rubric(), &subject()).await.unwrap();
        let second = orchestrator.run(&rubric(), &subject()).await.unwrap();

        assert_eq!(critical.calls(), 2);
        assert_eq!(second.usage.calls, 0);
        assert_eq!(second.usage.cache_hits, 6);
        assert_eq!(first.outcomes, second.outcomes);

        orchestrator.clear_cache();
        let third = orchestrator.run(&rubric(), &subject()).await.unwrap();
        assert_eq!(third.usage.cache_hits, 0);
        assert_eq!(critical.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_refuses_calls() {
        let mut config = no_cache();
        config.budgets.global_max_tokens = 1_000;
        let orchestrator = default_evaluators(standard(config)).build().unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();
        assert_eq!(report.usage.refused_calls, 6);
        assert_eq!(report.usage.calls, 0);
        assert_eq!(report.insufficient().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_derives_evidence() {
        let orchestrator = default_evaluators(standard(no_cache()).hook(Arc::new(CrossReference)))
            .build()
            .unwrap();

        let report = orchestrator.run(&rubric(), &subject()).await.unwrap();
        let derived = report
            .state
            .evidence()
            .get(&EvidenceKey::new("crossref", "report-claims"))
            .unwrap();
        assert!(derived.found);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_pressure_does_not_depend_on_completion_order() {
        let build = |critical_first: bool| {
            let (c, p) = if critical_first { (1, 100) } else { (100, 1) };
            let mut config = no_cache();
            config.budgets.global_max_tokens = 5_400;
            config.budgets.estimated_tokens_per_call = 1_000;
            standard(config)
                .evaluator(Arc::new(
                    MockEvaluator::scoring(Role::Critical, 1)
                        .costing(1_000)
                        .delayed(Duration::from_millis(c)),
                ))
                .evaluator(Arc::new(MockEvaluator::scoring(Role::Supportive, 4).costing(1_000)))
                .evaluator(Arc::new(
                    MockEvaluator::scoring(Role::Pragmatic, 5)
                        .costing(1_000)
                        .delayed(Duration::from_millis(p)),
                ))
                .build()
                .unwrap()
        };

        let first = build(true).run(&rubric(), &subject()).await.unwrap();
        let second = build(false).run(&rubric(), &subject()).await.unwrap();

        assert_eq!(first.state, second.state);
        assert_eq!(first.outcomes, second.outcomes);
        assert_eq!(first.usage, second.usage);

        // pragmatic on the last criterion is the one pair the global budget cannot cover
        assert_eq!(first.usage.refused_calls, 1);
        let refused: Vec<_> = first
            .state
            .errors_of(ErrorKind::EvaluatorFailure)
            .map(|r| r.task_id.as_str())
            .collect();
        assert_eq!(refused, vec!["pragmatic/report"]);
        assert!(first.state.opinions().get("report", Role::Pragmatic).unwrap().degraded);
        assert!(!first.state.opinions().get("report", Role::Critical).unwrap().degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stricter_rubric_misses_cache() {
        let critical = Arc::new(MockEvaluator::scoring(Role::Critical, 2));
        let orchestrator = standard(RuntimeConfig::default())
            .evaluator(critical.clone())
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Supportive, 4)))
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Pragmatic, 4)))
            .build()
            .unwrap();

        orchestrator.run(&rubric(), &subject()).await.unwrap();

        let mut strict = rubric();
        strict.coercion.min_rationale_len = 500;
        let report = orchestrator.run(&strict, &subject()).await.unwrap();

        assert_eq!(report.usage.cache_hits, 0);
        // 2 first-run calls, then 1 call + 2 re-elicitations per criterion
        assert_eq!(critical.calls(), 8);
        let opinion = report.state.opinions().get("graph", Role::Critical).unwrap();
        assert!(opinion.degraded);
        assert_eq!(report.state.errors_of(ErrorKind::SchemaValidationFailure).count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_cancels_running_collectors() {
        let mut rogue = MockCollector::new("repo", "repository", vec![("src/graph.rs", true)]);
        rogue.foreign = true;
        let slow = Arc::new(
            MockCollector::new("docs", "report", vec![("report.pdf", true)])
                .delayed(Duration::from_secs(30)),
        );
        let orchestrator = default_evaluators(
            RunOrchestrator::builder()
                .config(no_cache().fail_fast())
                .collector(Arc::new(rogue))
                .collector(slow.clone()),
        )
        .build()
        .unwrap();

        let err = orchestrator.run(&rubric(), &subject()).await.unwrap_err();
        let partial = err.partial_state().unwrap();
        assert!(partial.evidence().is_empty());
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow.completed.load(Ordering::SeqCst), 0);

        // the aborted task stays cancelled once its sleep would have ended
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(slow.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_cancels_running_evaluators() {
        let slow = Arc::new(MockEvaluator::scoring(Role::Pragmatic, 4).delayed(Duration::from_secs(20)));
        let orchestrator = standard(no_cache().fail_fast())
            .evaluator(Arc::new(MockEvaluator::new(Role::Critical, |_| {
                Err(AgentError::Internal("model unavailable".to_string()))
            })))
            .evaluator(slow.clone())
            .build()
            .unwrap();

        let err = orchestrator.run(&rubric(), &subject()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Aborted { stage: Stage::Reconcile, .. }));
        let partial = err.partial_state().unwrap();
        assert!(partial.opinions().get("graph", Role::Pragmatic).is_none());
        assert!(partial.opinions().is_empty());
        assert_eq!(slow.calls(), 1);
        assert_eq!(slow.completed(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(slow.completed(), 0);
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let err = RunOrchestrator::builder()
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Critical, 2)))
            .evaluator(Arc::new(MockEvaluator::scoring(Role::Critical, 3)))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("role 'critical'"));

        let err = RunOrchestrator::builder()
            .collector(Arc::new(MockCollector::new("repo", "repository", vec![])))
            .hook(Arc::new(CrossReference))
            .collector(Arc::new(MockCollector::new("crossref", "report", vec![])))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("registered twice"));
    }
}
