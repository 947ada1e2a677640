//! Citation grounding against the evidence store.

use crate::evidence::{EvidenceKey, EvidenceStore};
use crate::types::{ErrorKind, ErrorRecord, Role, Stage};

/// Result of checking a list of citations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grounded {
    /// Citations present in the store, deduplicated, in first-cited order
    pub kept: Vec<EvidenceKey>,
    /// Raw text of every citation that was pruned
    pub removed: Vec<String>,
}

impl Grounded {
    /// Rationale with one `[unverified claim removed: ...]` note per pruning.
    pub fn annotate(&self, rationale: &str) -> String {
        let mut annotated = rationale.trim_end().to_string();
        for citation in &self.removed {
            annotated.push_str(&format!("\n[unverified claim removed: {}]", citation));
        }
        annotated
    }

    /// One non-fatal error record per pruned citation.
    pub fn violations(&self, criterion_id: &str, role: Role) -> Vec<ErrorRecord> {
        self.removed
            .iter()
            .map(|citation| {
                ErrorRecord::new(
                    Stage::Evaluate,
                    format!("{}/{}", role, criterion_id),
                    ErrorKind::GroundingViolation,
                    format!("cited evidence '{}' is not in the evidence store", citation),
                )
            })
            .collect()
    }
}

/// Split citations into grounded keys and pruned text.
///
/// A citation is pruned when it does not parse as `collector:location` or
/// names a key the store does not hold.
pub fn ground<'a, I>(citations: I, store: &EvidenceStore) -> Grounded
where
    I: IntoIterator<Item = &'a str>,
{
    let mut grounded = Grounded::default();
    for citation in citations {
        match EvidenceKey::parse(citation) {
            Ok(key) if store.contains(&key) => {
                if !grounded.kept.contains(&key) {
                    grounded.kept.push(key);
                }
            }
            _ => {
                tracing::debug!(citation = %citation, "Pruning ungrounded citation");
                grounded.removed.push(citation.trim().to_string());
            }
        }
    }
    grounded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::EvidencePartial;

    fn store() -> EvidenceStore {
        EvidenceStore::from_partials(vec![EvidencePartial::new("repo")
            .record("src/graph.rs", true, 0.9, "fan-out present")
            .record("src/state.rs", false, 0.8, "no reducers")])
    }

    #[test]
    fn test_known_keys_kept_in_order() {
        let grounded = ground(["repo:src/state.rs", "repo:src/graph.rs", "repo:src/state.rs"], &store());
        assert_eq!(
            grounded.kept,
            vec![
                EvidenceKey::new("repo", "src/state.rs"),
                EvidenceKey::new("repo", "src/graph.rs"),
            ]
        );
        assert!(grounded.removed.is_empty());
    }

    #[test]
    fn test_unknown_and_malformed_pruned() {
        let grounded = ground(["repo:src/ghost.rs", "nonsense"], &store());
        assert!(grounded.kept.is_empty());
        assert_eq!(grounded.removed, vec!["repo:src/ghost.rs", "nonsense"]);

        let annotated = grounded.annotate("Rationale.");
        assert!(annotated.contains("[unverified claim removed: repo:src/ghost.rs]"));
        assert!(annotated.contains("[unverified claim removed: nonsense]"));

        let records = grounded.violations("c1", Role::Supportive);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.kind == ErrorKind::GroundingViolation));
        assert_eq!(records[0].task_id, "supportive/c1");
    }
}
