//! Persona prompts for reasoning-backed evaluators.
//!
//! Prompts are split for cache efficiency:
//! 1. Base prompt (shared by every persona)
//! 2. Persona prompt
//! 3. Dynamic content (criterion, evidence, feedback), never cached

use tribunal_core::{Criterion, Evidence, EvidenceStore, Role, Score};

/// Base system prompt shared by every persona.
pub const BASE_SYSTEM_PROMPT: &str = r#"
You are one of three independent reviewers on an evaluation bench.

You score ONE criterion of a submitted project on a 1-5 scale.
You only see evidence gathered by automated collectors.
You never see the other reviewers' opinions.

## Rules
1. Score only the criterion you are given. Do not invent criteria.
2. Base every claim on the evidence listed. Cite entries as "collector:location".
3. Do not cite anything that is not listed; unlisted citations are removed.
4. Evidence marked NOT FOUND means the collector looked and found nothing.

## Output Format (JSON)
{
  "criterion_id": "string",
  "score": 1-5,
  "rationale": "your argument, referring to the evidence",
  "cited_evidence": ["collector:location", ...]
}

Reply with the JSON object only.
"#;

/// Critical reviewer.
pub const CRITICAL_PROMPT: &str = r#"
## Persona: Prosecutor

Core philosophy: "Trust no one. Assume shortcuts were taken."

- Look for gaps, security flaws, and claims the evidence does not support.
- Missing evidence counts against the submission.
- Name concrete flaws. If you find a security problem, say "security" plainly.
- Do not award a high score because the work looks busy.
"#;

/// Supportive reviewer.
pub const SUPPORTIVE_PROMPT: &str = r#"
## Persona: Defense Attorney

Core philosophy: "Reward effort and intent. Look for the spirit of the work."

- Highlight what was attempted and what partially works.
- Credit sound design even when execution is incomplete.
- Stay honest: you may not cite evidence that is NOT FOUND as proof of quality.
"#;

/// Pragmatic reviewer.
pub const PRAGMATIC_PROMPT: &str = r#"
## Persona: Tech Lead

Core philosophy: "Does it actually work? Is it maintainable?"

- Judge practical soundness: does the artifact do what it claims?
- Weigh technical debt and maintainability over style.
- Your score is the tie-breaker; be balanced and concrete.
"#;

/// Persona prompt for a role.
pub fn persona_prompt(role: Role) -> &'static str {
    match role {
        Role::Critical => CRITICAL_PROMPT,
        Role::Supportive => SUPPORTIVE_PROMPT,
        Role::Pragmatic => PRAGMATIC_PROMPT,
    }
}

/// Full system prompt for a role.
pub fn system_prompt(role: Role) -> String {
    format!("{}{}", BASE_SYSTEM_PROMPT, persona_prompt(role))
}

/// Limits applied when rendering evidence into a prompt.
#[derive(Debug, Clone, Copy)]
pub struct EvidenceLimits {
    pub max_items_per_collector: usize,
    pub max_chars: usize,
    pub max_context_chars: usize,
}

impl Default for EvidenceLimits {
    fn default() -> Self {
        Self {
            max_items_per_collector: 4,
            max_chars: 160,
            max_context_chars: 2400,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}

fn format_evidence_line(evidence: &Evidence, limits: &EvidenceLimits) -> String {
    let status = if evidence.found { "FOUND" } else { "NOT FOUND" };
    let mut line = format!(
        "- [{}] {} (confidence {:.2}): {}",
        evidence.key(),
        status,
        evidence.confidence,
        truncate(&evidence.summary, limits.max_chars)
    );
    if let Some(content) = &evidence.content {
        line.push_str(&format!("\n  > {}", truncate(content, limits.max_chars)));
    }
    line
}

/// Render the evidence block, grouped by collector.
///
/// Output is deterministic: collectors and entries appear in key order.
pub fn format_evidence(store: &EvidenceStore, limits: &EvidenceLimits) -> String {
    if store.is_empty() {
        return "No evidence was collected.".to_string();
    }

    let mut sections = Vec::new();
    for collector in store.collectors() {
        let mut lines = vec![format!("### {}", collector)];
        let entries: Vec<&Evidence> = store.by_collector(collector).collect();
        for evidence in entries.iter().take(limits.max_items_per_collector) {
            lines.push(format_evidence_line(evidence, limits));
        }
        if entries.len() > limits.max_items_per_collector {
            lines.push(format!(
                "- ({} more entries omitted)",
                entries.len() - limits.max_items_per_collector
            ));
        }
        sections.push(lines.join("\n"));
    }

    truncate(&sections.join("\n\n"), limits.max_context_chars)
}

/// Build the user prompt for one criterion.
pub fn user_prompt(
    criterion: &Criterion,
    judicial_logic: Option<&str>,
    evidence: &EvidenceStore,
    limits: &EvidenceLimits,
    min_rationale_len: usize,
    feedback: Option<&str>,
) -> String {
    let mut prompt = format!(
        "## Criterion\nid: {}\nname: {}\n",
        criterion.id, criterion.name
    );

    if !criterion.description.is_empty() {
        prompt.push_str(&format!("description: {}\n", criterion.description));
    }
    if let Some(instruction) = &criterion.forensic_instruction {
        prompt.push_str(&format!("\n## What the collectors looked for\n{}\n", instruction));
    }
    if let Some(logic) = judicial_logic {
        prompt.push_str(&format!("\n## Scoring guidance for your role\n{}\n", logic));
    }

    prompt.push_str(&format!("\n## Evidence\n{}\n", format_evidence(evidence, limits)));

    prompt.push_str(&format!(
        "\n## Scale\nScore from {} (missing or broken) to {} (excellent). \
         Your rationale must be at least {} characters.\n",
        Score::MIN,
        Score::MAX,
        min_rationale_len
    ));

    if let Some(feedback) = feedback {
        prompt.push_str(&format!("\n## Correction\n{}\n", feedback));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tribunal_core::EvidencePartial;

    #[test]
    fn test_each_role_has_distinct_persona() {
        assert!(system_prompt(Role::Critical).contains("Prosecutor"));
        assert!(system_prompt(Role::Supportive).contains("Defense"));
        assert!(system_prompt(Role::Pragmatic).contains("Tech Lead"));
        assert!(system_prompt(Role::Pragmatic).contains("Output Format"));
    }

    #[test]
    fn test_evidence_marks_status_and_truncates() {
        let long = "x".repeat(500);
        let store = EvidenceStore::from_partials([EvidencePartial::new("repo")
            .record("src/a.rs", true, 0.9, long.as_str())
            .record("src/b.rs", false, 0.0, "absent")]);

        let text = format_evidence(&store, &EvidenceLimits::default());
        assert!(text.contains("[repo:src/a.rs] FOUND"));
        assert!(text.contains("[repo:src/b.rs] NOT FOUND"));
        assert!(!text.contains(&long));
    }

    #[test]
    fn test_evidence_items_capped_per_collector() {
        let mut partial = EvidencePartial::new("repo");
        for i in 0..6 {
            partial = partial.record(format!("f{}", i), true, 0.5, "ok");
        }
        let store = EvidenceStore::from_partials([partial]);
        let limits = EvidenceLimits {
            max_items_per_collector: 2,
            ..Default::default()
        };

        let text = format_evidence(&store, &limits);
        assert!(text.contains("repo:f0"));
        assert!(!text.contains("repo:f2"));
        assert!(text.contains("4 more entries omitted"));
    }

    proptest! {
        #[test]
        fn test_truncate_respects_limit(text in "\\PC{0,400}", max in 3usize..200) {
            let cut = truncate(&text, max);
            prop_assert!(cut.chars().count() <= max);
            if text.chars().count() <= max {
                prop_assert_eq!(cut, text);
            }
        }
    }

    #[test]
    fn test_user_prompt_includes_feedback() {
        let criterion = Criterion::new("graph", "Graph orchestration");
        let store = EvidenceStore::new();
        let limits = EvidenceLimits::default();

        let plain = user_prompt(&criterion, Some("Check fan-in."), &store, &limits, 100, None);
        assert!(plain.contains("Check fan-in."));
        assert!(plain.contains("at least 100 characters"));
        assert!(!plain.contains("## Correction"));

        let retry = user_prompt(&criterion, None, &store, &limits, 100, Some("too short"));
        assert!(retry.contains("## Correction\ntoo short"));
    }
}
