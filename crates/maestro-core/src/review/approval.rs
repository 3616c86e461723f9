//! Phase approval policies over dual-review results.
//!
//! Each reviewed phase carries a policy and a score threshold. When one
//! reviewer is missing (timed out or failed past its retry budget) the
//! single-agent fallback applies a score penalty and a higher minimum, so
//! a lone opinion has to clear a taller bar.

use serde::{Deserialize, Serialize};

use super::conflict::{self, ResolutionStrategy};
use super::parallel::ReviewOutcome;

/// How many approvals a phase needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    #[default]
    AllMustApprove,
    AnyMayApprove,
    /// Approve when the strategy-combined score clears the threshold.
    WeightedScore,
}

/// Which reviewer wins the single-agent fallback when both produced
/// usable output but policy wants one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SingleAgentPreference {
    /// First responder by wall clock.
    #[default]
    Any,
    Cursor,
    Gemini,
}

impl SingleAgentPreference {
    pub fn parse(s: &str) -> Self {
        match s {
            "cursor" => Self::Cursor,
            "gemini" => Self::Gemini,
            _ => Self::Any,
        }
    }
}

/// Per-phase approval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub policy: ApprovalPolicy,
    pub threshold: f64,
    pub strategy: ResolutionStrategy,
    pub allow_single_agent: bool,
    pub single_agent_penalty: f64,
    pub single_agent_minimum: f64,
    pub preference: SingleAgentPreference,
}

impl ApprovalConfig {
    /// Plan validation (phase 2): weighted resolution, 6.0 bar.
    pub fn validation(threshold: f64) -> Self {
        Self {
            policy: ApprovalPolicy::AllMustApprove,
            threshold,
            strategy: ResolutionStrategy::Weighted,
            allow_single_agent: true,
            single_agent_penalty: 1.0,
            single_agent_minimum: 7.5,
            preference: SingleAgentPreference::Any,
        }
    }

    /// Implementation verification (phase 4): conservative resolution,
    /// 7.0 bar.
    pub fn verification(threshold: f64) -> Self {
        Self {
            strategy: ResolutionStrategy::Conservative,
            ..Self::validation(threshold)
        }
    }
}

/// The engine's approval verdict for a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub approved: bool,
    pub effective_score: f64,
    pub reasoning: String,
    /// Set when the single-agent fallback decided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_agent: Option<String>,
    pub conflicts: usize,
}

/// Evaluate the dual-review outcome under a config.
///
/// The result shape in is always `(cursor, gemini)`; a reviewer that
/// timed out or failed arrives as an outcome with no feedback and an
/// explicit error string.
pub fn evaluate(
    cursor: &ReviewOutcome,
    gemini: &ReviewOutcome,
    config: &ApprovalConfig,
) -> ApprovalResult {
    match (&cursor.feedback, &gemini.feedback) {
        (Some(cf), Some(gf)) => {
            let report = conflict::resolve(cf, gf, config.strategy);
            let (approved, reasoning) = match config.policy {
                ApprovalPolicy::AllMustApprove => {
                    let both = cf.is_approving()
                        && gf.is_approving()
                        && cf.score() >= config.threshold
                        && gf.score() >= config.threshold
                        && report.approving;
                    (
                        both,
                        format!(
                            "all_must_approve: cursor {:.1}, gemini {:.1}, threshold {:.1}",
                            cf.score(),
                            gf.score(),
                            config.threshold
                        ),
                    )
                }
                ApprovalPolicy::AnyMayApprove => {
                    let any = (cf.is_approving() && cf.score() >= config.threshold)
                        || (gf.is_approving() && gf.score() >= config.threshold);
                    (
                        any,
                        format!(
                            "any_may_approve: cursor {:.1}, gemini {:.1}, threshold {:.1}",
                            cf.score(),
                            gf.score(),
                            config.threshold
                        ),
                    )
                }
                ApprovalPolicy::WeightedScore => {
                    let passes = report.approving && report.combined_score >= config.threshold;
                    (
                        passes,
                        format!(
                            "weighted_score: combined {:.2} vs threshold {:.1}",
                            report.combined_score, config.threshold
                        ),
                    )
                }
            };
            ApprovalResult {
                approved,
                effective_score: report.combined_score,
                reasoning,
                single_agent: None,
                conflicts: report.conflicts.len(),
            }
        }

        (Some(cf), None) => single_agent_verdict("cursor", cf, config),
        (None, Some(gf)) => single_agent_verdict("gemini", gf, config),

        (None, None) => ApprovalResult {
            approved: false,
            effective_score: 0.0,
            reasoning: format!(
                "no usable reviewer output (cursor: {}; gemini: {})",
                cursor.error.as_deref().unwrap_or("missing"),
                gemini.error.as_deref().unwrap_or("missing"),
            ),
            single_agent: None,
            conflicts: 0,
        },
    }
}

fn single_agent_verdict(
    name: &str,
    feedback: &super::feedback::Feedback,
    config: &ApprovalConfig,
) -> ApprovalResult {
    if !config.allow_single_agent {
        return ApprovalResult {
            approved: false,
            effective_score: feedback.score(),
            reasoning: format!("single-agent approval disabled; only {name} responded"),
            single_agent: Some(name.to_string()),
            conflicts: 0,
        };
    }

    // Preference narrows which lone survivor may approve.
    let preferred = match config.preference {
        SingleAgentPreference::Any => true,
        SingleAgentPreference::Cursor => name == "cursor",
        SingleAgentPreference::Gemini => name == "gemini",
    };
    if !preferred {
        return ApprovalResult {
            approved: false,
            effective_score: feedback.score(),
            reasoning: format!(
                "single-agent fallback requires {:?}, but only {name} responded",
                config.preference
            ),
            single_agent: Some(name.to_string()),
            conflicts: 0,
        };
    }

    let adjusted = feedback.score() - config.single_agent_penalty;
    let bar = config.threshold.max(config.single_agent_minimum);
    let approved = feedback.is_approving() && adjusted >= bar;

    ApprovalResult {
        approved,
        effective_score: adjusted,
        reasoning: format!(
            "single-agent fallback ({name}): {:.1} - {:.1} penalty = {:.1} vs minimum {:.1}",
            feedback.score(),
            config.single_agent_penalty,
            adjusted,
            bar
        ),
        single_agent: Some(name.to_string()),
        conflicts: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::feedback::normalize_feedback;
    use std::time::Duration;

    fn outcome(reviewer: &str, assessment: &str, score: f64) -> ReviewOutcome {
        let value = serde_json::json!({"overall_assessment": assessment, "score": score});
        ReviewOutcome {
            feedback: Some(normalize_feedback(reviewer, Some(&value), None)),
            error: None,
            duration: Duration::from_secs(10),
        }
    }

    fn missing(error: &str) -> ReviewOutcome {
        ReviewOutcome {
            feedback: None,
            error: Some(error.to_string()),
            duration: Duration::from_secs(300),
        }
    }

    #[test]
    fn both_approve_above_threshold_passes() {
        let config = ApprovalConfig::validation(6.0);
        let result = evaluate(
            &outcome("cursor", "approve", 8.0),
            &outcome("gemini", "approve", 7.0),
            &config,
        );
        assert!(result.approved);
        assert_eq!(result.single_agent, None);
    }

    #[test]
    fn one_below_threshold_fails_all_must_approve() {
        let config = ApprovalConfig::validation(6.0);
        let result = evaluate(
            &outcome("cursor", "approve", 8.0),
            &outcome("gemini", "approve", 5.0),
            &config,
        );
        assert!(!result.approved);
    }

    #[test]
    fn any_may_approve_needs_just_one() {
        let config = ApprovalConfig {
            policy: ApprovalPolicy::AnyMayApprove,
            ..ApprovalConfig::validation(6.0)
        };
        let result = evaluate(
            &outcome("cursor", "reject", 2.0),
            &outcome("gemini", "approve", 7.0),
            &config,
        );
        assert!(result.approved);
    }

    #[test]
    fn weighted_score_policy_uses_combined() {
        let config = ApprovalConfig {
            policy: ApprovalPolicy::WeightedScore,
            ..ApprovalConfig::validation(6.0)
        };
        let result = evaluate(
            &outcome("cursor", "approve", 8.0),
            &outcome("gemini", "approve", 6.0),
            &config,
        );
        assert!(result.approved);
        assert!(result.effective_score > 6.0);
    }

    #[test]
    fn single_agent_fallback_applies_penalty_and_minimum() {
        let config = ApprovalConfig::validation(6.0);

        // 8.6 - 1.0 = 7.6 >= 7.5: approved.
        let result = evaluate(&outcome("cursor", "approve", 8.6), &missing("timed out"), &config);
        assert!(result.approved);
        assert_eq!(result.single_agent.as_deref(), Some("cursor"));

        // 8.0 - 1.0 = 7.0 < 7.5: not approved even though it clears the
        // normal threshold.
        let result = evaluate(&outcome("cursor", "approve", 8.0), &missing("timed out"), &config);
        assert!(!result.approved);
    }

    #[test]
    fn single_agent_exactly_at_minimum_approves() {
        let config = ApprovalConfig::validation(6.0);
        let result = evaluate(&missing("timed out"), &outcome("gemini", "approve", 8.5), &config);
        assert!(result.approved, "8.5 - 1.0 = 7.5 meets the minimum exactly");
        assert_eq!(result.single_agent.as_deref(), Some("gemini"));
    }

    #[test]
    fn single_agent_respects_preference() {
        let config = ApprovalConfig {
            preference: SingleAgentPreference::Gemini,
            ..ApprovalConfig::validation(6.0)
        };
        let result = evaluate(&outcome("cursor", "approve", 9.5), &missing("dead"), &config);
        assert!(!result.approved);
        assert!(result.reasoning.contains("Gemini"));
    }

    #[test]
    fn single_agent_disabled_never_approves() {
        let config = ApprovalConfig {
            allow_single_agent: false,
            ..ApprovalConfig::validation(6.0)
        };
        let result = evaluate(&outcome("cursor", "approve", 9.9), &missing("dead"), &config);
        assert!(!result.approved);
    }

    #[test]
    fn both_missing_is_explicit_failure() {
        let config = ApprovalConfig::validation(6.0);
        let result = evaluate(&missing("timed out"), &missing("crashed"), &config);
        assert!(!result.approved);
        assert!(result.reasoning.contains("timed out"));
        assert!(result.reasoning.contains("crashed"));
    }

    #[test]
    fn verification_config_is_conservative() {
        let config = ApprovalConfig::verification(7.0);
        assert_eq!(config.strategy, ResolutionStrategy::Conservative);
        // Polarity conflict rejects under conservative resolution.
        let result = evaluate(
            &outcome("cursor", "approve", 9.0),
            &outcome("gemini", "reject", 6.0),
            &config,
        );
        assert!(!result.approved);
        assert_eq!(result.conflicts, 1);
    }

    #[test]
    fn preference_parse() {
        assert_eq!(SingleAgentPreference::parse("cursor"), SingleAgentPreference::Cursor);
        assert_eq!(SingleAgentPreference::parse("gemini"), SingleAgentPreference::Gemini);
        assert_eq!(SingleAgentPreference::parse("any"), SingleAgentPreference::Any);
        assert_eq!(SingleAgentPreference::parse("bogus"), SingleAgentPreference::Any);
    }
}
