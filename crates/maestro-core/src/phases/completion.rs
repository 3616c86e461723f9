//! Phase 5: Completion. Emits the structured summary, the human-readable
//! report, and the handoff brief.

use anyhow::Result;
use chrono::Utc;

use maestro_db::queries::{audit, budget, tasks, workflow};

use crate::actionlog::{ActionEntry, ActionType};
use crate::handoff;
use crate::phases::decode_phase_map;

use super::{Phase, PhaseContext, PhaseOutcome};

/// Build the structured completion summary from storage.
async fn build_summary(ctx: &PhaseContext) -> Result<serde_json::Value> {
    let state = workflow::get_state(&ctx.pool)
        .await?
        .ok_or_else(|| anyhow::anyhow!("workflow state not initialized"))?;
    let progress = tasks::get_progress(&ctx.pool).await?;
    let all_tasks = tasks::list_all_tasks(&ctx.pool).await?;
    let audit_stats = audit::get_statistics(&ctx.pool).await?;
    let (tokens_in, tokens_out) = budget::token_totals(&ctx.pool).await?;
    let total_cost = budget::project_spent(&ctx.pool).await?;

    let files_created: usize = all_tasks.iter().map(|t| t.files_created.len()).sum();
    let files_modified: usize = all_tasks.iter().map(|t| t.files_modified.len()).sum();

    let tests_passed = all_tasks
        .iter()
        .filter(|t| {
            t.test_results
                .as_ref()
                .and_then(|r| r.get("passed"))
                .and_then(|p| p.as_bool())
                .unwrap_or(false)
        })
        .count();
    let tests_failed = all_tasks
        .iter()
        .filter(|t| {
            t.test_results
                .as_ref()
                .and_then(|r| r.get("passed"))
                .and_then(|p| p.as_bool())
                == Some(false)
        })
        .count();

    let phase_map = decode_phase_map(&state.phase_status);
    let phase_durations: serde_json::Value = phase_map
        .iter()
        .map(|(number, entry)| {
            (
                number.to_string(),
                serde_json::json!({
                    "status": entry.status,
                    "attempts": entry.attempts,
                    "started_at": entry.started_at,
                    "completed_at": entry.completed_at,
                }),
            )
        })
        .collect::<serde_json::Map<_, _>>()
        .into();

    let approved = state
        .verification_feedback
        .as_ref()
        .and_then(|f| f.get("recommendation"))
        .and_then(|r| r.as_str())
        == Some("proceed");

    let failed_tasks: Vec<&str> = all_tasks
        .iter()
        .filter(|t| t.status == maestro_db::models::StepStatus::Failed)
        .map(|t| t.id.as_str())
        .collect();

    let mut next_steps: Vec<String> = Vec::new();
    if !failed_tasks.is_empty() {
        next_steps.push(format!(
            "Investigate permanently failed tasks: {}",
            failed_tasks.join(", ")
        ));
    }
    if tests_failed > 0 {
        next_steps.push("Re-run the failing test suites and fix remaining breakage.".to_string());
    }
    if !approved {
        next_steps.push("Address reviewer concerns recorded in verification feedback.".to_string());
    }
    if next_steps.is_empty() {
        next_steps.push("Ship it: all tasks completed and both reviewers approved.".to_string());
    }

    Ok(serde_json::json!({
        "project_dir": state.project_dir,
        "generated_at": Utc::now().to_rfc3339(),
        "approved": approved,
        "tasks": {
            "total": progress.total,
            "completed": progress.completed,
            "failed": progress.failed,
            "blocked": progress.blocked,
        },
        "files_created": files_created,
        "files_modified": files_modified,
        "tests_passed": tests_passed,
        "tests_failed": tests_failed,
        "token_usage": {"input": tokens_in, "output": tokens_out},
        "total_cost_usd": total_cost,
        "agent_invocations": audit_stats.total_invocations,
        "agent_failures": audit_stats.failures,
        "agent_timeouts": audit_stats.timeouts,
        "git_commits": state.git_commits,
        "phase_durations": phase_durations,
        "iteration_count": state.iteration_count,
        "recommended_next_steps": next_steps,
    }))
}

/// Render `COMPLETION.md`.
fn render_completion_markdown(summary: &serde_json::Value) -> String {
    let tasks = &summary["tasks"];
    let mut lines = vec![
        "# Workflow Completion Report".to_string(),
        String::new(),
        format!("- **Project:** {}", summary["project_dir"].as_str().unwrap_or("?")),
        format!("- **Approved:** {}", summary["approved"]),
        format!(
            "- **Tasks:** {} completed, {} failed, {} blocked (of {})",
            tasks["completed"], tasks["failed"], tasks["blocked"], tasks["total"]
        ),
        format!(
            "- **Files:** {} created, {} modified",
            summary["files_created"], summary["files_modified"]
        ),
        format!(
            "- **Tests:** {} passed, {} failed",
            summary["tests_passed"], summary["tests_failed"]
        ),
        format!(
            "- **Tokens:** {} in / {} out",
            summary["token_usage"]["input"], summary["token_usage"]["output"]
        ),
        format!("- **Cost:** ${}", summary["total_cost_usd"]),
        format!(
            "- **Agent invocations:** {} ({} failures, {} timeouts)",
            summary["agent_invocations"], summary["agent_failures"], summary["agent_timeouts"]
        ),
        String::new(),
        "## Recommended Next Steps".to_string(),
        String::new(),
    ];

    if let Some(steps) = summary["recommended_next_steps"].as_array() {
        for step in steps {
            lines.push(format!("- {}", step.as_str().unwrap_or("?")));
        }
    }

    if let Some(commits) = summary["git_commits"].as_array()
        && !commits.is_empty()
    {
        lines.push(String::new());
        lines.push("## Commits".to_string());
        lines.push(String::new());
        for commit in commits {
            lines.push(format!(
                "- phase {}: `{}` {}",
                commit["phase"],
                commit["hash"].as_str().unwrap_or("?"),
                commit["message"].as_str().unwrap_or("")
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Run the completion node.
pub async fn run(ctx: &PhaseContext) -> Result<PhaseOutcome> {
    let summary = build_summary(ctx).await?;

    ctx.write_phase_artifact(Phase::Completion, "completion-summary.json", &summary)?;
    ctx.write_phase_text(
        Phase::Completion,
        "COMPLETION.md",
        &render_completion_markdown(&summary),
    )?;

    // Final handoff brief.
    let state = workflow::get_state(&ctx.pool)
        .await?
        .ok_or_else(|| anyhow::anyhow!("workflow state not initialized"))?;
    let brief = handoff::build_brief(&state, ctx.log.last(), Vec::new());
    handoff::write_brief(&ctx.workflow_dir, &brief)?;

    ctx.log.append(ActionEntry::new(
        ActionType::WorkflowEnd,
        format!("workflow complete (approved = {})", summary["approved"]),
    ));

    Ok(PhaseOutcome::continue_with(summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_report_carries_metrics() {
        let summary = serde_json::json!({
            "project_dir": "/work/widget",
            "approved": true,
            "tasks": {"total": 4, "completed": 4, "failed": 0, "blocked": 0},
            "files_created": 7,
            "files_modified": 3,
            "tests_passed": 4,
            "tests_failed": 0,
            "token_usage": {"input": 10_000, "output": 2_000},
            "total_cost_usd": 1.25,
            "agent_invocations": 12,
            "agent_failures": 1,
            "agent_timeouts": 0,
            "git_commits": [
                {"phase": 1, "hash": "abc123", "message": "planning complete"},
            ],
            "recommended_next_steps": ["Ship it: all tasks completed and both reviewers approved."],
        });

        let md = render_completion_markdown(&summary);
        assert!(md.contains("# Workflow Completion Report"));
        assert!(md.contains("4 completed, 0 failed"));
        assert!(md.contains("7 created, 3 modified"));
        assert!(md.contains("`abc123`"));
        assert!(md.contains("Ship it"));
    }
}
