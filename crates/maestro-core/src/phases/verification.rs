//! Phase 4: Verification. The same dual-review mechanics as validation,
//! now over changed files and test results, under the stricter
//! conservative conflict strategy.

use anyhow::Result;
use tracing::info;

use maestro_db::queries::{tasks, workflow};

use crate::actionlog::{ActionEntry, ActionStatus, ActionType};
use crate::review::ApprovalConfig;
use crate::spec::is_docs_only_change;

use super::validation::run_dual_review_phase;
use super::{Phase, PhaseContext, PhaseOutcome};

fn implementation_review_prompt(
    focus: &str,
    changed_files: &[String],
    test_summary: &serde_json::Value,
) -> String {
    let files = if changed_files.is_empty() {
        "- none detected".to_string()
    } else {
        changed_files
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You are reviewing an implementation. Focus: {focus}.\n\n\
         CHANGED FILES:\n{files}\n\n\
         TEST RESULTS:\n{tests}\n\n\
         Read the changed files and judge whether the implementation is \
         correct, complete, and safe to ship.\n\n\
         Respond with JSON only:\n\
         {{\"reviewer\": \"...\", \"overall_assessment\": \
         \"approve|approve_with_changes|reject\", \"score\": 0.0,\n\
          \"strengths\": [], \"concerns\": [], \"blocking_issues\": [],\n\
          \"files_modified\": [], \"test_results\": {{}}}}",
        tests = serde_json::to_string_pretty(test_summary).unwrap_or_default(),
    )
}

/// Collect changed files since the last recorded commit before
/// implementation.
async fn changed_files_since_plan(ctx: &PhaseContext) -> Vec<String> {
    let state = match workflow::get_state(&ctx.pool).await {
        Ok(Some(state)) => state,
        _ => return Vec::new(),
    };

    // The most recent commit recorded at or before phase 2 marks the
    // pre-implementation tree.
    let base = state
        .git_commits
        .as_array()
        .and_then(|commits| {
            commits
                .iter()
                .rev()
                .find(|c| c.get("phase").and_then(|p| p.as_i64()).unwrap_or(99) <= 2)
        })
        .and_then(|c| c.get("hash").and_then(|h| h.as_str()))
        .map(str::to_string);

    match base {
        Some(hash) => ctx.git.changed_files(&hash).await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Run the verification node.
pub async fn run(ctx: &PhaseContext) -> Result<PhaseOutcome> {
    ctx.log.append(
        ActionEntry::new(ActionType::PhaseStart, "verification started")
            .phase(4)
            .status(ActionStatus::Started),
    );

    let changed = changed_files_since_plan(ctx).await;

    // Docs-only fast path: prose changes skip the dual code review when
    // review gating is on.
    if ctx.config.workflow.review_gating && is_docs_only_change(&changed) {
        info!(files = changed.len(), "docs-only change set, skipping dual review");
        ctx.log.append(
            ActionEntry::new(
                ActionType::VerificationPass,
                "docs-only change set, review gating fast path",
            )
            .phase(4),
        );
        return Ok(PhaseOutcome::continue_with(serde_json::json!({
            "approved": true,
            "fast_path": "docs_only",
            "changed_files": changed,
        })));
    }

    // Summarize task-level test results for the reviewers.
    let all_tasks = tasks::list_all_tasks(&ctx.pool).await?;
    let test_summary = serde_json::json!({
        "tasks_total": all_tasks.len(),
        "tasks_completed": all_tasks
            .iter()
            .filter(|t| t.status == maestro_db::models::StepStatus::Completed)
            .count(),
        "tasks_failed": all_tasks
            .iter()
            .filter(|t| t.status == maestro_db::models::StepStatus::Failed)
            .count(),
        "per_task": all_tasks
            .iter()
            .filter_map(|t| t.test_results.as_ref().map(|r| (t.id.clone(), r.clone())))
            .collect::<std::collections::BTreeMap<_, _>>(),
    });

    let approval_config = ApprovalConfig {
        preference: crate::review::SingleAgentPreference::parse(
            &ctx.config.review.single_agent_preference,
        ),
        allow_single_agent: ctx.config.review.allow_single_agent_approval,
        single_agent_penalty: ctx.config.review.single_agent_score_penalty,
        single_agent_minimum: ctx.config.review.single_agent_minimum_score,
        ..ApprovalConfig::verification(ctx.config.validation.verification_threshold)
    };

    let review = run_dual_review_phase(
        ctx,
        Phase::Verification,
        implementation_review_prompt(
            "code quality, correctness, security",
            &changed,
            &test_summary,
        ),
        implementation_review_prompt(
            "architecture, integration, maintainability",
            &changed,
            &test_summary,
        ),
        &approval_config,
    )
    .await?;

    if review.approval.approved {
        ctx.log.append(
            ActionEntry::new(
                ActionType::VerificationPass,
                format!("implementation approved ({})", review.approval.reasoning),
            )
            .phase(4),
        );
        Ok(PhaseOutcome::continue_with(serde_json::json!({
            "approved": true,
            "effective_score": review.approval.effective_score,
            "changed_files": changed,
            "single_agent": review.approval.single_agent,
        })))
    } else {
        ctx.log.append(
            ActionEntry::new(
                ActionType::VerificationFail,
                format!("implementation rejected ({})", review.approval.reasoning),
            )
            .phase(4)
            .status(ActionStatus::Failed),
        );
        Ok(PhaseOutcome::retry(review.approval.reasoning))
    }
}
