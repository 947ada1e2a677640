//! Opinion cache.
//!
//! Re-running the same rubric over the same evidence should not pay for the
//! same reasoning calls twice. Entries hold the full coercion result so
//! grounding violations are reported again on a hit.
//!
//! Keys cover everything that shaped the request or judged its output: the
//! criterion definition, role guidance, evidence scope and coercion policy.
//! Changing any of them in a later rubric misses the cache.

use moka::future::Cache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tribunal_core::{CoercionPolicy, Coerced, Role};

use crate::agents::EvaluationRequest;
use crate::config::CacheConfig;

/// Cache key for one (criterion, role) opinion.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    criterion_id: String,
    role: Role,
    evidence_fingerprint: u64,
    request_hash: u64,
}

impl CacheKey {
    pub fn new(
        request: &EvaluationRequest,
        role: Role,
        evidence_fingerprint: u64,
        policy: &CoercionPolicy,
    ) -> Self {
        Self {
            criterion_id: request.criterion.id.clone(),
            role,
            evidence_fingerprint,
            request_hash: hash_request(request, policy),
        }
    }
}

/// Coerced-opinion cache using moka.
pub struct OpinionCache {
    cache: Cache<CacheKey, Coerced>,
}

impl OpinionCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl)
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Coerced> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: CacheKey, coerced: Coerced) {
        self.cache.insert(key, coerced).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

impl Default for OpinionCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

fn hash_request(request: &EvaluationRequest, policy: &CoercionPolicy) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(&request.criterion).ok().hash(&mut hasher);
    request.judicial_logic.hash(&mut hasher);
    request.relevant_collectors.hash(&mut hasher);
    request.min_rationale_len.hash(&mut hasher);
    serde_json::to_string(policy).ok().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tribunal_core::{Criterion, EvidenceStore, Opinion, Score};

    fn coerced(score: u8) -> Coerced {
        Coerced {
            opinion: Opinion::new("graph", Role::Pragmatic, Score::new(score).unwrap(), "works"),
            violations: vec![],
        }
    }

    fn request() -> EvaluationRequest {
        EvaluationRequest {
            criterion: Criterion::new("graph", "Graph orchestration"),
            evidence: Arc::new(EvidenceStore::new()),
            judicial_logic: Some("be strict".to_string()),
            relevant_collectors: None,
            min_rationale_len: 100,
            feedback: None,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_cache_operations() {
        let cache = OpinionCache::default();
        let policy = CoercionPolicy::default();
        let key = CacheKey::new(&request(), Role::Pragmatic, 42, &policy);

        assert!(cache.get(&key).await.is_none());

        cache.insert(key.clone(), coerced(4)).await;
        let cached = cache.get(&key).await.unwrap();
        assert_eq!(cached.opinion.score.value(), 4);
    }

    #[tokio::test]
    async fn test_key_separates_inputs() {
        let cache = OpinionCache::default();
        let policy = CoercionPolicy::default();
        let base = request();
        cache
            .insert(CacheKey::new(&base, Role::Pragmatic, 42, &policy), coerced(4))
            .await;

        assert!(cache.get(&CacheKey::new(&base, Role::Critical, 42, &policy)).await.is_none());
        assert!(cache.get(&CacheKey::new(&base, Role::Pragmatic, 43, &policy)).await.is_none());

        let mut other = base.clone();
        other.judicial_logic = None;
        assert!(cache.get(&CacheKey::new(&other, Role::Pragmatic, 42, &policy)).await.is_none());

        let mut other = base.clone();
        other.criterion.description = "Reworded".to_string();
        assert!(cache.get(&CacheKey::new(&other, Role::Pragmatic, 42, &policy)).await.is_none());

        let mut other = base.clone();
        other.relevant_collectors = Some(vec!["repo".to_string()]);
        assert!(cache.get(&CacheKey::new(&other, Role::Pragmatic, 42, &policy)).await.is_none());
    }

    #[tokio::test]
    async fn test_key_tracks_coercion_policy() {
        let cache = OpinionCache::default();
        let lenient = CoercionPolicy {
            min_rationale_len: 20,
            ..CoercionPolicy::default()
        };
        let strict = CoercionPolicy {
            min_rationale_len: 500,
            ..CoercionPolicy::default()
        };
        cache
            .insert(CacheKey::new(&request(), Role::Pragmatic, 42, &lenient), coerced(4))
            .await;

        assert!(cache.get(&CacheKey::new(&request(), Role::Pragmatic, 42, &lenient)).await.is_some());
        assert!(cache.get(&CacheKey::new(&request(), Role::Pragmatic, 42, &strict)).await.is_none());
    }
}
