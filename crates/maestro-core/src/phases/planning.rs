//! Phase 1: Planning. The planner turns the product spec into a task
//! plan, persisted as `plan.json` and a human-readable `PLAN.md`.

use anyhow::Result;
use tracing::{info, warn};

use maestro_db::models::TaskPriority;
use maestro_db::queries::tasks::{self, NewTask};
use maestro_db::queries::workflow;

use crate::actionlog::{ActionEntry, ActionStatus, ActionType};
use crate::agents::InvocationRequest;
use crate::jsonx;

use super::{Phase, PhaseContext, PhaseOutcome};

/// Prompt sent to the planner.
fn planning_prompt(spec_content: &str) -> String {
    format!(
        "You are a senior software architect. Analyze the product \
         specification and produce an implementation plan.\n\n\
         PRODUCT SPECIFICATION:\n{spec_content}\n\n\
         Respond with JSON only:\n\
         {{\n\
           \"plan_name\": \"...\",\n\
           \"summary\": \"...\",\n\
           \"tasks\": [\n\
             {{\"id\": \"T1\", \"title\": \"...\", \"user_story\": \"...\",\n\
              \"acceptance_criteria\": [\"...\"], \"dependencies\": [],\n\
              \"files_to_create\": [], \"files_to_modify\": [],\n\
              \"test_files\": [], \"priority\": \"high|medium|low\"}}\n\
           ],\n\
           \"test_strategy\": {{\"test_commands\": [\"...\"]}},\n\
           \"risks\": [\"...\"]\n\
         }}\n\n\
         Break the work into small, testable tasks with explicit \
         dependencies. Plan tests before implementation."
    )
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Convert a parsed plan into task rows. Tasks without an id or title are
/// skipped with a warning rather than sinking the whole plan.
pub fn plan_to_tasks(plan: &serde_json::Value) -> Vec<NewTask> {
    let Some(items) = plan.get("tasks").and_then(|t| t.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|v| v.as_str())?.to_string();
            let title = item.get("title").and_then(|v| v.as_str())?.to_string();
            let priority = item
                .get("priority")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<TaskPriority>().ok());
            Some(NewTask {
                id,
                title,
                user_story: item
                    .get("user_story")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                acceptance_criteria: string_list(item.get("acceptance_criteria")),
                dependencies: string_list(item.get("dependencies")),
                files_to_create: string_list(item.get("files_to_create")),
                files_to_modify: string_list(item.get("files_to_modify")),
                test_files: string_list(item.get("test_files")),
                priority,
                max_attempts: None,
            })
        })
        .collect()
}

/// Render the human-readable plan.
pub fn render_plan_markdown(plan: &serde_json::Value) -> String {
    let mut lines = vec![
        format!(
            "# Plan: {}",
            plan.get("plan_name").and_then(|v| v.as_str()).unwrap_or("unnamed")
        ),
        String::new(),
        plan.get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        String::new(),
        "## Tasks".to_string(),
        String::new(),
    ];

    if let Some(items) = plan.get("tasks").and_then(|t| t.as_array()) {
        for item in items {
            let id = item.get("id").and_then(|v| v.as_str()).unwrap_or("?");
            let title = item.get("title").and_then(|v| v.as_str()).unwrap_or("untitled");
            let deps = string_list(item.get("dependencies"));
            let deps_note = if deps.is_empty() {
                String::new()
            } else {
                format!(" (depends on {})", deps.join(", "))
            };
            lines.push(format!("- **{id}**: {title}{deps_note}"));
            for criterion in string_list(item.get("acceptance_criteria")) {
                lines.push(format!("  - {criterion}"));
            }
        }
    }

    if let Some(risks) = plan.get("risks").and_then(|r| r.as_array())
        && !risks.is_empty()
    {
        lines.push(String::new());
        lines.push("## Risks".to_string());
        lines.push(String::new());
        for risk in risks {
            if let Some(text) = risk.as_str() {
                lines.push(format!("- {text}"));
            }
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Run the planning node.
pub async fn run(ctx: &PhaseContext) -> Result<PhaseOutcome> {
    ctx.log.append(
        ActionEntry::new(ActionType::PhaseStart, "planning started")
            .phase(1)
            .status(ActionStatus::Started),
    );

    // Spec validation, with auto-generation when discovery is enabled.
    let spec_path = match crate::spec::ensure_product_spec(
        &ctx.project_dir,
        ctx.config.documentation_discovery_enabled(),
    ) {
        Ok(path) => path,
        Err(e) => {
            // Missing spec is a configuration failure: fatal before any
            // agent call.
            ctx.log.append(
                ActionEntry::new(ActionType::PhaseFailed, "no usable product spec")
                    .phase(1)
                    .error_text(e.to_string()),
            );
            return Ok(PhaseOutcome::abort(format!("product spec unavailable: {e}")));
        }
    };

    let spec_content = match std::fs::read_to_string(&spec_path) {
        Ok(content) => content,
        Err(e) => {
            return Ok(PhaseOutcome::abort(format!(
                "failed to read {}: {e}",
                spec_path.display()
            )));
        }
    };

    // Invoke the planner under the agent retry policy.
    let request = InvocationRequest {
        task_id: None,
        prompt: planning_prompt(&spec_content),
        session_args: Vec::new(),
        timeout: None,
        max_cost_usd: None,
        allowed_tools: vec!["Read".to_string(), "Glob".to_string(), "Grep".to_string()],
    };
    let policy = crate::retry::RetryPolicy::for_agents(&ctx.config.retry);
    let result = ctx
        .invoker
        .invoke_with_retry(ctx.claude.as_ref(), &request, &policy)
        .await;

    if !result.success {
        let error = result.error.unwrap_or_else(|| "planner failed".to_string());
        ctx.log.append(
            ActionEntry::new(ActionType::AgentError, "planner invocation failed")
                .phase(1)
                .agent("claude")
                .error_text(error.clone()),
        );
        return Ok(if result.retryable {
            PhaseOutcome::retry(error)
        } else {
            PhaseOutcome::escalate(error)
        });
    }

    // Parse ladder: parsed JSON from the invoker, then extraction from
    // raw output, then failure.
    let plan = match result.parsed {
        Some(value) => value,
        None => match jsonx::parse_lenient(&result.output) {
            Some((value, _)) => value,
            None => {
                warn!("planner output contained no JSON plan");
                return Ok(PhaseOutcome::retry("planner output was not parseable as a plan"));
            }
        },
    };

    let new_tasks = plan_to_tasks(&plan);
    if new_tasks.is_empty() {
        return Ok(PhaseOutcome::retry("plan contained no usable tasks"));
    }

    // Persist artifacts and state.
    ctx.write_phase_artifact(Phase::Planning, "plan.json", &plan)?;
    ctx.write_phase_text(Phase::Planning, "PLAN.md", &render_plan_markdown(&plan))?;
    workflow::update_plan(&ctx.pool, &plan).await?;

    let mut created = 0usize;
    for new_task in &new_tasks {
        match tasks::insert_task(&ctx.pool, new_task).await {
            Ok(_) => created += 1,
            Err(e) => warn!(task_id = %new_task.id, error = %e, "failed to insert planned task"),
        }
    }
    if created == 0 {
        return Ok(PhaseOutcome::retry("no planned tasks could be persisted"));
    }

    info!(tasks = created, "planning complete");
    ctx.log.append(
        ActionEntry::new(
            ActionType::PhaseComplete,
            format!("planning produced {created} tasks"),
        )
        .phase(1)
        .agent("claude"),
    );

    Ok(PhaseOutcome::continue_with(serde_json::json!({
        "tasks": created,
        "plan_name": plan.get("plan_name"),
    })))
}
