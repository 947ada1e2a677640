//! Reasoning-backed evaluator with a fixed persona.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tribunal_core::{RawOutput, Role};

use super::traits::{AgentError, Elicitation, EvaluationRequest, Evaluator};
use crate::prompts::{self, EvidenceLimits};
use crate::providers::{ChatMessage, CompletionConfig, LlmProvider};

/// Prompt and completion settings for a persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub completion: CompletionConfig,

    pub max_evidence_items_per_collector: usize,

    /// Per-entry character limit for summaries and snippets
    pub max_evidence_chars: usize,

    /// Limit for the whole evidence block
    pub max_context_chars: usize,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            completion: CompletionConfig::default(),
            max_evidence_items_per_collector: 4,
            max_evidence_chars: 160,
            max_context_chars: 2400,
        }
    }
}

impl PersonaConfig {
    fn limits(&self) -> EvidenceLimits {
        EvidenceLimits {
            max_items_per_collector: self.max_evidence_items_per_collector,
            max_chars: self.max_evidence_chars,
            max_context_chars: self.max_context_chars,
        }
    }
}

/// An [`Evaluator`] that asks a model to argue as one persona.
pub struct PersonaEvaluator {
    role: Role,
    provider: Arc<dyn LlmProvider>,
    config: PersonaConfig,
}

impl PersonaEvaluator {
    pub fn new(role: Role, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            role,
            provider,
            config: PersonaConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PersonaConfig) -> Self {
        self.config = config;
        self
    }

    /// The three standard personas sharing one provider.
    pub fn bench(provider: Arc<dyn LlmProvider>, config: PersonaConfig) -> Vec<PersonaEvaluator> {
        Role::ALL
            .into_iter()
            .map(|role| PersonaEvaluator::new(role, provider.clone()).with_config(config.clone()))
            .collect()
    }

    fn messages(&self, request: &EvaluationRequest) -> Vec<ChatMessage> {
        let evidence = request.scoped_evidence();
        let user = prompts::user_prompt(
            &request.criterion,
            request.judicial_logic.as_deref(),
            &evidence,
            &self.config.limits(),
            request.min_rationale_len,
            request.feedback.as_deref(),
        );
        vec![
            ChatMessage::system(prompts::system_prompt(self.role)),
            ChatMessage::user(user),
        ]
    }
}

#[async_trait]
impl Evaluator for PersonaEvaluator {
    fn role(&self) -> Role {
        self.role
    }

    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Elicitation, AgentError> {
        let messages = self.messages(request);
        tracing::debug!(
            role = %self.role,
            criterion = %request.criterion.id,
            attempt = request.attempt,
            provider = self.provider.name(),
            "Eliciting opinion"
        );

        let response = self
            .provider
            .complete(messages, &self.config.completion)
            .await?;

        Ok(Elicitation {
            output: RawOutput::Text(response.content),
            usage: response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CompletionResponse, ProviderError, TokenUsage};
    use parking_lot::Mutex;
    use tribunal_core::{Criterion, EvidencePartial, EvidenceStore};

    struct RecordingProvider {
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl LlmProvider for RecordingProvider {
        async fn complete(
            &self,
            messages: Vec<ChatMessage>,
            _config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            self.seen.lock().push(messages);
            Ok(CompletionResponse {
                content: r#"{"score": 4, "rationale": "fine", "cited_evidence": []}"#.to_string(),
                usage: TokenUsage {
                    prompt_tokens: 120,
                    completion_tokens: 30,
                },
                model: "mock".to_string(),
                stop_reason: None,
            })
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn test_prompt_uses_persona_and_scoped_evidence() {
        let provider = Arc::new(RecordingProvider {
            seen: Mutex::new(Vec::new()),
        });
        let evaluator = PersonaEvaluator::new(Role::Critical, provider.clone());

        let store = EvidenceStore::from_partials([
            EvidencePartial::new("repo").record("src/graph.rs", true, 0.9, "fan-out present"),
            EvidencePartial::new("docs").record("report.pdf", false, 0.0, "missing"),
        ]);
        let request = EvaluationRequest {
            criterion: Criterion::new("graph", "Graph orchestration").with_target("repository"),
            evidence: Arc::new(store),
            judicial_logic: Some("Penalise linear pipelines.".to_string()),
            relevant_collectors: Some(vec!["repo".to_string()]),
            min_rationale_len: 200,
            feedback: Some("Rationale too short".to_string()),
            attempt: 1,
        };

        let elicitation = evaluator.evaluate(&request).await.unwrap();
        assert_eq!(elicitation.usage.total(), 150);
        assert!(matches!(elicitation.output, RawOutput::Text(_)));

        let seen = provider.seen.lock();
        let messages = &seen[0];
        assert!(messages[0].content.contains("Prosecutor"));
        assert!(messages[1].content.contains("repo:src/graph.rs"));
        assert!(!messages[1].content.contains("report.pdf"));
        assert!(messages[1].content.contains("Penalise linear pipelines."));
        assert!(messages[1].content.contains("Rationale too short"));
        assert!(messages[1].content.contains("at least 200 characters"));
    }

    #[test]
    fn test_bench_covers_every_role() {
        let provider = Arc::new(RecordingProvider {
            seen: Mutex::new(Vec::new()),
        });
        let roles: Vec<Role> = PersonaEvaluator::bench(provider, PersonaConfig::default())
            .iter()
            .map(|e| e.role())
            .collect();
        assert_eq!(roles, Role::ALL.to_vec());
    }
}
