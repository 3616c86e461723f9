//! Phase 2: Validation. Both reviewers critique the plan in parallel;
//! conflicts are resolved and the approval policy applied.
//!
//! Cursor reviews for code quality, security, and maintainability;
//! Gemini reviews for architecture, scalability, and design. The fan-out
//! machinery here is shared with phase 4 (verification), which reviews
//! the implementation instead of the plan.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use maestro_db::queries::workflow;

use crate::actionlog::{ActionEntry, ActionStatus, ActionType};
use crate::agents::{AgentCli, InvocationRequest};
use crate::invoker::AgentInvoker;
use crate::review::{
    ApprovalConfig, ApprovalResult, ReviewOutcome, conflict, feedback::Feedback,
    normalize_feedback, run_dual_review,
};

use super::{Phase, PhaseContext, PhaseOutcome};

/// Everything one dual review produces, for artifact writing and
/// persistence.
pub struct DualReviewResult {
    pub cursor: ReviewOutcome,
    pub gemini: ReviewOutcome,
    pub approval: ApprovalResult,
    pub consolidated: serde_json::Value,
}

fn review_future(
    invoker: AgentInvoker,
    cli: Arc<dyn AgentCli>,
    prompt: String,
    timeout: Duration,
) -> impl Future<Output = ReviewOutcome> + Send + 'static {
    async move {
        let started = Instant::now();
        let request = InvocationRequest {
            task_id: None,
            prompt,
            session_args: Vec::new(),
            timeout: Some(timeout),
            max_cost_usd: None,
            allowed_tools: vec!["Read".to_string(), "Glob".to_string(), "Grep".to_string()],
        };
        let result = invoker.invoke(cli.as_ref(), &request).await;
        let duration = started.elapsed();

        if result.success && result.parsed.is_some() {
            ReviewOutcome {
                feedback: Some(normalize_feedback(
                    cli.name(),
                    result.parsed.as_ref(),
                    result.error.as_deref(),
                )),
                error: None,
                duration,
            }
        } else {
            ReviewOutcome {
                feedback: None,
                error: Some(
                    result
                        .error
                        .unwrap_or_else(|| "reviewer produced no parseable output".to_string()),
                ),
                duration,
            }
        }
    }
}

/// Merge both feedbacks into the consolidated artifact.
fn consolidate(
    cursor: &ReviewOutcome,
    gemini: &ReviewOutcome,
    approval: &ApprovalResult,
) -> serde_json::Value {
    let feedback_json = |outcome: &ReviewOutcome| match &outcome.feedback {
        Some(feedback) => serde_json::to_value(feedback)
            .unwrap_or_else(|_| serde_json::json!({"error": "unserializable feedback"})),
        None => serde_json::json!({
            "error": outcome.error.as_deref().unwrap_or("no feedback received"),
        }),
    };

    let mut all_concerns = Vec::new();
    let mut blocking_issues: Vec<String> = Vec::new();
    let mut all_strengths: Vec<serde_json::Value> = Vec::new();

    for (name, outcome) in [("cursor", cursor), ("gemini", gemini)] {
        let Some(feedback) = &outcome.feedback else {
            continue;
        };
        for concern in feedback.concerns() {
            let mut value = serde_json::to_value(concern).unwrap_or_default();
            value["source"] = serde_json::json!(name);
            if concern.severity == crate::review::Severity::High {
                blocking_issues.push(concern.description.clone());
            }
            all_concerns.push(value);
        }
        if let crate::review::Assessment::Approve { strengths, .. } = &feedback.assessment {
            for strength in strengths {
                all_strengths.push(serde_json::json!({"source": name, "strength": strength}));
            }
        }
        if let crate::review::Assessment::Reject { blocking_issues: issues, .. } =
            &feedback.assessment
        {
            blocking_issues.extend(issues.iter().cloned());
        }
    }

    let score = |outcome: &ReviewOutcome| outcome.feedback.as_ref().map(Feedback::score);
    let approving = |outcome: &ReviewOutcome| {
        outcome.feedback.as_ref().map(Feedback::is_approving).unwrap_or(false)
    };

    let recommendation = if approval.approved {
        "proceed"
    } else if !approving(cursor) && !approving(gemini) {
        "revise_plan"
    } else {
        "review_concerns"
    };

    serde_json::json!({
        "validators": {
            "cursor": feedback_json(cursor),
            "gemini": feedback_json(gemini),
        },
        "summary": {
            "cursor_score": score(cursor),
            "gemini_score": score(gemini),
            "effective_score": approval.effective_score,
            "reasoning": approval.reasoning,
        },
        "all_concerns": all_concerns,
        "all_strengths": all_strengths,
        "blocking_issues": blocking_issues,
        "recommendation": recommendation,
    })
}

/// Human-readable consolidated feedback.
fn render_feedback_markdown(consolidated: &serde_json::Value, phase: Phase) -> String {
    let summary = &consolidated["summary"];
    let mut lines = vec![
        format!("# {} Review Results", capitalize(phase.name())),
        String::new(),
        "| Reviewer | Score |".to_string(),
        "|----------|-------|".to_string(),
        format!("| Cursor | {} |", summary["cursor_score"]),
        format!("| Gemini | {} |", summary["gemini_score"]),
        String::new(),
        format!(
            "**Recommendation:** {}",
            consolidated["recommendation"].as_str().unwrap_or("unknown")
        ),
        String::new(),
    ];

    if let Some(blocking) = consolidated["blocking_issues"].as_array()
        && !blocking.is_empty()
    {
        lines.push("## Blocking Issues".to_string());
        lines.push(String::new());
        for issue in blocking {
            lines.push(format!("- {}", issue.as_str().unwrap_or("?")));
        }
        lines.push(String::new());
    }

    if let Some(concerns) = consolidated["all_concerns"].as_array()
        && !concerns.is_empty()
    {
        lines.push("## Concerns".to_string());
        lines.push(String::new());
        for concern in concerns {
            lines.push(format!(
                "- **{}** ({}, {}): {}",
                concern["area"].as_str().unwrap_or("general"),
                concern["severity"].as_str().unwrap_or("medium"),
                concern["source"].as_str().unwrap_or("?"),
                concern["description"].as_str().unwrap_or("")
            ));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Run a dual review of `subject`, write all artifacts for `phase`, and
/// persist the consolidated feedback on the workflow state.
pub async fn run_dual_review_phase(
    ctx: &PhaseContext,
    phase: Phase,
    cursor_prompt: String,
    gemini_prompt: String,
    approval_config: &ApprovalConfig,
) -> Result<DualReviewResult> {
    let timeout = Duration::from_secs(ctx.config.review.reviewer_timeout_seconds);

    let (cursor, gemini) = run_dual_review(
        review_future(ctx.invoker.clone(), Arc::clone(&ctx.cursor), cursor_prompt, timeout),
        review_future(ctx.invoker.clone(), Arc::clone(&ctx.gemini), gemini_prompt, timeout),
        timeout,
    )
    .await;

    let approval = crate::review::approval::evaluate(&cursor, &gemini, approval_config);

    // Conflicts feed the consolidated artifact when both sides responded.
    let consolidated = {
        let mut value = consolidate(&cursor, &gemini, &approval);
        if let (Some(cf), Some(gf)) = (&cursor.feedback, &gemini.feedback) {
            let conflicts = conflict::detect_conflicts(cf, gf);
            if !conflicts.is_empty() {
                value["conflicts"] = serde_json::to_value(&conflicts)?;
            }
        }
        value
    };

    // Per-reviewer artifacts.
    for (name, outcome) in [("cursor", &cursor), ("gemini", &gemini)] {
        let artifact = match &outcome.feedback {
            Some(feedback) => serde_json::to_value(feedback)?,
            None => serde_json::json!({
                "reviewer": name,
                "error": outcome.error.as_deref().unwrap_or("no result"),
            }),
        };
        ctx.write_phase_artifact(phase, &format!("{name}-feedback.json"), &artifact)?;
    }

    ctx.write_phase_artifact(phase, "consolidated-feedback.json", &consolidated)?;
    ctx.write_phase_text(
        phase,
        "consolidated-feedback.md",
        &render_feedback_markdown(&consolidated, phase),
    )?;
    ctx.write_phase_artifact(phase, "approval-result.json", &serde_json::to_value(&approval)?)?;

    workflow::update_feedback(&ctx.pool, phase.number(), &consolidated).await?;

    Ok(DualReviewResult {
        cursor,
        gemini,
        approval,
        consolidated,
    })
}

fn plan_review_prompt(focus: &str, plan: &serde_json::Value) -> String {
    format!(
        "You are reviewing an implementation plan. Focus: {focus}.\n\n\
         PLAN:\n{plan}\n\n\
         Respond with JSON only:\n\
         {{\"reviewer\": \"...\", \"overall_assessment\": \
         \"approve|approve_with_changes|reject\", \"score\": 0.0,\n\
          \"strengths\": [\"...\"],\n\
          \"concerns\": [{{\"severity\": \"high|medium|low\", \"area\": \"...\", \
         \"description\": \"...\", \"suggestion\": \"...\"}}],\n\
          \"blocking_issues\": [\"...\"]}}\n\n\
         Score 0-10. Anything scoring below 6 needs a clear explanation.",
        plan = serde_json::to_string_pretty(plan).unwrap_or_default(),
    )
}

/// Run the validation node.
pub async fn run(ctx: &PhaseContext) -> Result<PhaseOutcome> {
    ctx.log.append(
        ActionEntry::new(ActionType::PhaseStart, "validation started")
            .phase(2)
            .status(ActionStatus::Started),
    );

    let state = workflow::get_state(&ctx.pool)
        .await?
        .ok_or_else(|| anyhow::anyhow!("workflow state not initialized"))?;
    let Some(plan) = state.plan else {
        return Ok(PhaseOutcome::escalate("plan.json missing; planning must complete first"));
    };

    let approval_config = ApprovalConfig {
        preference: crate::review::SingleAgentPreference::parse(
            &ctx.config.review.single_agent_preference,
        ),
        allow_single_agent: ctx.config.review.allow_single_agent_approval,
        single_agent_penalty: ctx.config.review.single_agent_score_penalty,
        single_agent_minimum: ctx.config.review.single_agent_minimum_score,
        ..ApprovalConfig::validation(ctx.config.validation.validation_threshold)
    };

    let review = run_dual_review_phase(
        ctx,
        Phase::Validation,
        plan_review_prompt("code quality, security, maintainability", &plan),
        plan_review_prompt("architecture, scalability, design patterns", &plan),
        &approval_config,
    )
    .await?;

    if review.approval.approved {
        ctx.log.append(
            ActionEntry::new(
                ActionType::ValidationPass,
                format!("plan approved ({})", review.approval.reasoning),
            )
            .phase(2),
        );
        Ok(PhaseOutcome::continue_with(serde_json::json!({
            "approved": true,
            "effective_score": review.approval.effective_score,
            "single_agent": review.approval.single_agent,
        })))
    } else {
        // Rejection bumps the plan iteration counter; the runner decides
        // between replanning and escalation based on attempts.
        let iteration = workflow::increment_iteration(&ctx.pool).await?;
        ctx.log.append(
            ActionEntry::new(
                ActionType::ValidationFail,
                format!(
                    "plan rejected ({}), iteration {iteration}",
                    review.approval.reasoning
                ),
            )
            .phase(2)
            .status(ActionStatus::Failed),
        );
        Ok(PhaseOutcome::retry(review.approval.reasoning))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::normalize_feedback;

    fn outcome_with(assessment: &str, score: f64, reviewer: &str) -> ReviewOutcome {
        let value = serde_json::json!({
            "overall_assessment": assessment,
            "score": score,
            "strengths": ["solid decomposition"],
        });
        ReviewOutcome {
            feedback: Some(normalize_feedback(reviewer, Some(&value), None)),
            error: None,
            duration: Duration::from_secs(1),
        }
    }

    fn approval(approved: bool) -> ApprovalResult {
        ApprovalResult {
            approved,
            effective_score: 7.0,
            reasoning: "test".to_string(),
            single_agent: None,
            conflicts: 0,
        }
    }

    #[test]
    fn consolidation_includes_both_validators() {
        let cursor = outcome_with("approve", 8.0, "cursor");
        let gemini = outcome_with("approve", 7.0, "gemini");
        let consolidated = consolidate(&cursor, &gemini, &approval(true));

        assert_eq!(consolidated["summary"]["cursor_score"], 8.0);
        assert_eq!(consolidated["summary"]["gemini_score"], 7.0);
        assert_eq!(consolidated["recommendation"], "proceed");
        assert_eq!(consolidated["all_strengths"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn missing_reviewer_surfaces_as_error_entry() {
        let cursor = outcome_with("approve", 8.0, "cursor");
        let gemini = ReviewOutcome {
            feedback: None,
            error: Some("review timed out after 300 seconds".to_string()),
            duration: Duration::from_secs(300),
        };
        let consolidated = consolidate(&cursor, &gemini, &approval(false));
        assert!(
            consolidated["validators"]["gemini"]["error"]
                .as_str()
                .unwrap()
                .contains("timed out")
        );
    }

    #[test]
    fn double_rejection_recommends_replan() {
        let cursor = outcome_with("reject", 3.0, "cursor");
        let gemini = outcome_with("reject", 4.0, "gemini");
        let consolidated = consolidate(&cursor, &gemini, &approval(false));
        assert_eq!(consolidated["recommendation"], "revise_plan");
    }

    #[test]
    fn high_severity_concerns_become_blocking() {
        let value = serde_json::json!({
            "overall_assessment": "approve_with_changes",
            "score": 6.0,
            "concerns": [
                {"severity": "high", "area": "security", "description": "plaintext secrets"},
                {"severity": "low", "area": "style", "description": "naming"},
            ],
        });
        let cursor = ReviewOutcome {
            feedback: Some(normalize_feedback("cursor", Some(&value), None)),
            error: None,
            duration: Duration::from_secs(1),
        };
        let gemini = outcome_with("approve", 7.0, "gemini");
        let consolidated = consolidate(&cursor, &gemini, &approval(false));

        let blocking = consolidated["blocking_issues"].as_array().unwrap();
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0], "plaintext secrets");
    }

    #[test]
    fn markdown_render_contains_scores_and_concerns() {
        let cursor = outcome_with("approve", 8.0, "cursor");
        let gemini = outcome_with("approve", 7.5, "gemini");
        let consolidated = consolidate(&cursor, &gemini, &approval(true));
        let md = render_feedback_markdown(&consolidated, Phase::Validation);
        assert!(md.contains("# Validation Review Results"));
        assert!(md.contains("| Cursor | 8.0 |"));
        assert!(md.contains("proceed"));
    }

    #[test]
    fn review_prompt_embeds_plan() {
        let plan = serde_json::json!({"plan_name": "widgets"});
        let prompt = plan_review_prompt("architecture", &plan);
        assert!(prompt.contains("widgets"));
        assert!(prompt.contains("architecture"));
        assert!(prompt.contains("overall_assessment"));
    }
}
