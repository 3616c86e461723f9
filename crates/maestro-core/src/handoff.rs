//! The handoff brief: a machine- and human-readable resume point written
//! at workflow end or pause.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use maestro_db::models::{NextDecision, WorkflowState};

use crate::actionlog::ActionEntry;
use crate::phases::Phase;

/// Structured handoff brief.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffBrief {
    pub project_dir: String,
    pub current_phase: i32,
    pub phase_name: String,
    pub next_decision: NextDecision,
    pub iteration_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action: Option<ActionEntry>,
    pub blockers: Vec<String>,
    /// The single best next action for whoever picks this up.
    pub next_action: String,
    pub generated_at: String,
}

/// Derive the single best next action from the state.
fn best_next_action(state: &WorkflowState, blockers: &[String]) -> String {
    match state.next_decision {
        NextDecision::Abort => "Inspect the action log for the abort cause, then reset or rollback before restarting.".to_string(),
        NextDecision::Escalate => match blockers.first() {
            Some(blocker) => format!("Resolve the blocker ({blocker}), then run resume."),
            None => "Review the escalation in the action log, then run resume.".to_string(),
        },
        NextDecision::Retry => format!(
            "Re-run phase {} (it failed transiently and has retry budget left).",
            state.current_phase
        ),
        NextDecision::Continue => {
            if state.current_phase >= 5 {
                "Workflow complete; review completion-summary.json.".to_string()
            } else {
                format!(
                    "Run resume to continue from phase {} ({}).",
                    state.current_phase,
                    Phase::from_number(state.current_phase)
                        .map(|p| p.name().to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                )
            }
        }
    }
}

/// Build the brief from current state.
pub fn build_brief(
    state: &WorkflowState,
    last_action: Option<ActionEntry>,
    blockers: Vec<String>,
) -> HandoffBrief {
    let next_action = best_next_action(state, &blockers);
    HandoffBrief {
        project_dir: state.project_dir.clone(),
        current_phase: state.current_phase,
        phase_name: Phase::from_number(state.current_phase)
            .map(|p| p.name().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        next_decision: state.next_decision,
        iteration_count: state.iteration_count,
        last_action,
        blockers,
        next_action,
        generated_at: Utc::now().to_rfc3339(),
    }
}

/// Render the Markdown form.
pub fn render_markdown(brief: &HandoffBrief) -> String {
    let mut lines = vec![
        "# Handoff Brief".to_string(),
        String::new(),
        format!("- **Project:** {}", brief.project_dir),
        format!(
            "- **Current phase:** {} ({})",
            brief.current_phase, brief.phase_name
        ),
        format!("- **Next decision:** {}", brief.next_decision),
        format!("- **Iterations:** {}", brief.iteration_count),
        format!("- **Generated:** {}", brief.generated_at),
        String::new(),
    ];

    if let Some(action) = &brief.last_action {
        lines.push("## Last Action".to_string());
        lines.push(String::new());
        lines.push(format!(
            "`{}` {} ({:?})",
            action.timestamp, action.message, action.status
        ));
        lines.push(String::new());
    }

    if !brief.blockers.is_empty() {
        lines.push("## Blockers".to_string());
        lines.push(String::new());
        for blocker in &brief.blockers {
            lines.push(format!("- {blocker}"));
        }
        lines.push(String::new());
    }

    lines.push("## Next Action".to_string());
    lines.push(String::new());
    lines.push(brief.next_action.clone());
    lines.push(String::new());

    lines.join("\n")
}

/// Write `handoff_brief.json` and `handoff_brief.md` into the workflow
/// directory.
pub fn write_brief(workflow_dir: &Path, brief: &HandoffBrief) -> Result<()> {
    std::fs::create_dir_all(workflow_dir)
        .with_context(|| format!("failed to create {}", workflow_dir.display()))?;

    let json_path = workflow_dir.join("handoff_brief.json");
    std::fs::write(&json_path, serde_json::to_string_pretty(brief)?)
        .with_context(|| format!("failed to write {}", json_path.display()))?;

    let md_path = workflow_dir.join("handoff_brief.md");
    std::fs::write(&md_path, render_markdown(brief))
        .with_context(|| format!("failed to write {}", md_path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_db::models::ExecutionMode;

    fn state(phase: i32, decision: NextDecision) -> WorkflowState {
        WorkflowState {
            id: uuid::Uuid::new_v4(),
            project_dir: "/work/widget".to_string(),
            current_phase: phase,
            phase_status: serde_json::json!({}),
            iteration_count: 2,
            plan: None,
            validation_feedback: None,
            verification_feedback: None,
            implementation_result: None,
            next_decision: decision,
            execution_mode: ExecutionMode::Afk,
            end_phase: 5,
            context_snapshot: None,
            token_usage: serde_json::json!({}),
            git_commits: serde_json::json!([]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn brief_names_phase_and_next_action() {
        let brief = build_brief(&state(3, NextDecision::Continue), None, vec![]);
        assert_eq!(brief.phase_name, "implementation");
        assert!(brief.next_action.contains("phase 3"));
    }

    #[test]
    fn escalation_mentions_first_blocker() {
        let brief = build_brief(
            &state(2, NextDecision::Escalate),
            None,
            vec!["reviewer timeout".to_string(), "other".to_string()],
        );
        assert!(brief.next_action.contains("reviewer timeout"));
    }

    #[test]
    fn completed_workflow_points_at_summary() {
        let brief = build_brief(&state(5, NextDecision::Continue), None, vec![]);
        assert!(brief.next_action.contains("completion-summary.json"));
    }

    #[test]
    fn files_are_written_and_parse_back() {
        let tmp = tempfile::tempdir().unwrap();
        let brief = build_brief(
            &state(1, NextDecision::Retry),
            None,
            vec!["planner flaked".to_string()],
        );
        write_brief(tmp.path(), &brief).unwrap();

        let json = std::fs::read_to_string(tmp.path().join("handoff_brief.json")).unwrap();
        let parsed: HandoffBrief = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.current_phase, 1);

        let md = std::fs::read_to_string(tmp.path().join("handoff_brief.md")).unwrap();
        assert!(md.contains("# Handoff Brief"));
        assert!(md.contains("planner flaked"));
    }
}
