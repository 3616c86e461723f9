//! Conflict detection and resolution between two reviewer feedbacks.
//!
//! Two reviewers looking at the same artifact can disagree: one approves
//! while the other rejects, or they report different observed facts
//! (errors, touched files, test results). Each conflicting field pair is
//! detected explicitly, then the configured strategy decides the combined
//! verdict.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::feedback::{Concern, Feedback};

/// How to resolve conflicting feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Any conflict rejects. Used for verification, where caution wins.
    Conservative,
    /// Score-weighted average; concerns union. The default for plan
    /// validation.
    #[default]
    Weighted,
    /// Reject unless the two verdicts are identical.
    Unanimous,
}

/// One field on which the reviewers disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub left: String,
    pub right: String,
}

/// Outcome of conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub strategy: ResolutionStrategy,
    pub conflicts: Vec<FieldConflict>,
    /// Whether the combined verdict is approving after resolution.
    pub approving: bool,
    /// Combined score under the strategy.
    pub combined_score: f64,
    /// Union of concerns from both reviewers.
    pub concerns: Vec<Concern>,
}

impl ConflictReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

fn push_conflict(
    conflicts: &mut Vec<FieldConflict>,
    field: &str,
    left: impl std::fmt::Debug,
    right: impl std::fmt::Debug,
) {
    conflicts.push(FieldConflict {
        field: field.to_string(),
        left: format!("{left:?}"),
        right: format!("{right:?}"),
    });
}

/// Detect all field-level conflicts between two feedbacks.
///
/// A field conflicts only when both sides set it to different values;
/// one-sided observations are complementary information, not conflict.
pub fn detect_conflicts(a: &Feedback, b: &Feedback) -> Vec<FieldConflict> {
    let mut conflicts = Vec::new();

    if a.is_approving() != b.is_approving() {
        push_conflict(
            &mut conflicts,
            "overall_assessment",
            a.is_approving(),
            b.is_approving(),
        );
    }

    if let (Some(left), Some(right)) = (&a.error, &b.error)
        && left != right
    {
        push_conflict(&mut conflicts, "error", left, right);
    }

    if !a.files_modified.is_empty()
        && !b.files_modified.is_empty()
        && a.files_modified != b.files_modified
    {
        push_conflict(&mut conflicts, "files_modified", &a.files_modified, &b.files_modified);
    }

    if !a.files_created.is_empty()
        && !b.files_created.is_empty()
        && a.files_created != b.files_created
    {
        push_conflict(&mut conflicts, "files_created", &a.files_created, &b.files_created);
    }

    if let (Some(left), Some(right)) = (&a.test_results, &b.test_results)
        && left != right
    {
        push_conflict(&mut conflicts, "test_results", left, right);
    }

    conflicts
}

/// Score-weighted average: each reviewer's score weighted by itself, so a
/// confident high score pulls harder than a tentative low one.
fn weighted_score(a: f64, b: f64) -> f64 {
    let total = a + b;
    if total == 0.0 {
        return 0.0;
    }
    (a * a + b * b) / total
}

/// Resolve two feedbacks under a strategy.
pub fn resolve(a: &Feedback, b: &Feedback, strategy: ResolutionStrategy) -> ConflictReport {
    let conflicts = detect_conflicts(a, b);
    if !conflicts.is_empty() {
        debug!(
            count = conflicts.len(),
            strategy = ?strategy,
            "reviewer feedback conflicts detected"
        );
    }

    let mut concerns: Vec<Concern> = a.concerns().to_vec();
    for concern in b.concerns() {
        if !concerns.contains(concern) {
            concerns.push(concern.clone());
        }
    }

    let (approving, combined_score) = match strategy {
        ResolutionStrategy::Conservative => {
            // Reject on any conflict; otherwise both must approve.
            let approving = conflicts.is_empty() && a.is_approving() && b.is_approving();
            (approving, a.score().min(b.score()))
        }
        ResolutionStrategy::Weighted => {
            let score = weighted_score(a.score(), b.score());
            // Polarity conflicts defer to the score; same-polarity verdicts
            // pass through.
            let approving = if a.is_approving() == b.is_approving() {
                a.is_approving()
            } else {
                score >= 5.0
            };
            (approving, score)
        }
        ResolutionStrategy::Unanimous => {
            let identical = a.assessment == b.assessment;
            (identical && a.is_approving(), a.score().min(b.score()))
        }
    };

    ConflictReport {
        strategy,
        conflicts,
        approving,
        combined_score,
        concerns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::feedback::normalize_feedback;

    fn approve(reviewer: &str, score: f64) -> Feedback {
        normalize_feedback(
            reviewer,
            Some(&serde_json::json!({"overall_assessment": "approve", "score": score})),
            None,
        )
    }

    fn reject(reviewer: &str, score: f64) -> Feedback {
        normalize_feedback(
            reviewer,
            Some(&serde_json::json!({"overall_assessment": "reject", "score": score})),
            None,
        )
    }

    #[test]
    fn agreement_has_no_conflicts() {
        let a = approve("cursor", 8.0);
        let b = approve("gemini", 7.0);
        assert!(detect_conflicts(&a, &b).is_empty());
    }

    #[test]
    fn polarity_disagreement_is_a_conflict() {
        let a = approve("cursor", 8.0);
        let b = reject("gemini", 4.0);
        let conflicts = detect_conflicts(&a, &b);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "overall_assessment");
    }

    #[test]
    fn differing_errors_conflict_but_one_sided_does_not() {
        let mut a = approve("cursor", 8.0);
        let mut b = approve("gemini", 8.0);

        a.error = Some("timeout on line 42".to_string());
        assert!(detect_conflicts(&a, &b).is_empty());

        b.error = Some("assertion failed on line 99".to_string());
        let conflicts = detect_conflicts(&a, &b);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "error");

        b.error = a.error.clone();
        assert!(detect_conflicts(&a, &b).is_empty());
    }

    #[test]
    fn differing_file_lists_and_test_results_conflict() {
        let mut a = approve("cursor", 8.0);
        let mut b = approve("gemini", 8.0);

        a.files_modified = vec!["a.rs".to_string()];
        b.files_modified = vec!["b.rs".to_string()];
        a.files_created = vec!["x.rs".to_string()];
        b.files_created = vec!["y.rs".to_string()];
        a.test_results = Some(serde_json::json!({"passed": 5}));
        b.test_results = Some(serde_json::json!({"passed": 3}));

        let fields: Vec<String> = detect_conflicts(&a, &b)
            .into_iter()
            .map(|c| c.field)
            .collect();
        assert_eq!(fields, vec!["files_modified", "files_created", "test_results"]);
    }

    #[test]
    fn conservative_rejects_on_conflict() {
        let a = approve("cursor", 9.0);
        let b = reject("gemini", 4.0);
        let report = resolve(&a, &b, ResolutionStrategy::Conservative);
        assert!(!report.approving);
        assert_eq!(report.combined_score, 4.0);
        assert!(report.has_conflicts());
    }

    #[test]
    fn conservative_approves_clean_agreement() {
        let a = approve("cursor", 8.0);
        let b = approve("gemini", 7.0);
        let report = resolve(&a, &b, ResolutionStrategy::Conservative);
        assert!(report.approving);
        assert_eq!(report.combined_score, 7.0);
    }

    #[test]
    fn weighted_score_pulls_toward_confident_reviewer() {
        // (8^2 + 4^2) / 12 = 80/12 ≈ 6.67: above the plain mean of 6.
        let score = weighted_score(8.0, 4.0);
        assert!(score > 6.0 && score < 7.0);
        assert_eq!(weighted_score(0.0, 0.0), 0.0);
    }

    #[test]
    fn weighted_resolves_polarity_conflict_by_score() {
        let strong = approve("cursor", 9.0);
        let weak_reject = reject("gemini", 3.0);
        let report = resolve(&strong, &weak_reject, ResolutionStrategy::Weighted);
        assert!(report.approving, "9.0 vs 3.0 weighted = 7.5, above the bar");

        let weak = approve("cursor", 4.0);
        let strong_reject = reject("gemini", 2.0);
        let report = resolve(&weak, &strong_reject, ResolutionStrategy::Weighted);
        assert!(!report.approving);
    }

    #[test]
    fn unanimous_requires_identical_assessments() {
        let a = approve("cursor", 8.0);
        let b = approve("gemini", 8.0);
        assert!(resolve(&a, &b, ResolutionStrategy::Unanimous).approving);

        let c = approve("gemini", 7.0);
        assert!(!resolve(&a, &c, ResolutionStrategy::Unanimous).approving);
    }

    #[test]
    fn concerns_union_deduplicates() {
        let with_concerns = |reviewer: &str| {
            normalize_feedback(
                reviewer,
                Some(&serde_json::json!({
                    "overall_assessment": "approve_with_changes",
                    "score": 6.0,
                    "concerns": [{"severity": "medium", "area": "style", "description": "long functions"}],
                })),
                None,
            )
        };
        let a = with_concerns("cursor");
        let b = with_concerns("gemini");
        let report = resolve(&a, &b, ResolutionStrategy::Weighted);
        assert_eq!(report.concerns.len(), 1);
    }
}
