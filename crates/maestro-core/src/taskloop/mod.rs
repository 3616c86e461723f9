//! The task loop: select-next-ready-task, implement, verify, fix-bug.
//!
//! Selection is a pure function over the task set so its iteration
//! semantics are directly testable: the bounded iteration counter
//! increments only when the *same* task is re-selected. Fifty sequential
//! tasks must never exhaust the default fifty-iteration cap.

pub mod parallel;
pub mod reducer;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

use maestro_db::models::{StepStatus, Task};
use maestro_db::queries::tasks;

use crate::actionlog::{ActionEntry, ActionLog, ActionType};
use crate::agents::{AgentCli, InvocationRequest};
use crate::budget::{BudgetDecision, BudgetEnforcer};
use crate::config::ProjectConfig;
use crate::invoker::AgentInvoker;
use crate::session::SessionManager;

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Loop-scoped bookkeeping, separate from persisted task state.
#[derive(Debug, Clone, Default)]
pub struct TaskLoopState {
    pub current_task_id: Option<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Bounded same-task retry counter.
    pub iterations: u32,
}

/// What selection produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Work on this task next.
    Task(Task),
    /// Every task is terminal.
    AllDone,
    /// Pending tasks exist but none are ready (dependency deadlock or
    /// everything blocked).
    Deadlocked,
    /// The same-task retry counter hit its cap.
    IterationLimit,
}

/// Pick the next ready task: highest priority first, then creation order.
///
/// Re-selecting the task already in `state.current_task_id` is a retry and
/// increments `state.iterations`; moving to a different task does not.
/// That distinction is what keeps long sequential plans from exhausting
/// the cap.
pub fn select_next_task(
    tasks: &[Task],
    state: &mut TaskLoopState,
    max_iterations: u32,
) -> Selection {
    let terminal = |status: StepStatus| {
        matches!(status, StepStatus::Completed | StepStatus::Failed | StepStatus::Blocked)
    };

    if tasks.iter().all(|t| terminal(t.status)) {
        return Selection::AllDone;
    }

    let completed: Vec<&str> = tasks
        .iter()
        .filter(|t| t.status == StepStatus::Completed)
        .map(|t| t.id.as_str())
        .collect();

    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == StepStatus::Pending)
        .filter(|t| t.dependencies.iter().all(|d| completed.contains(&d.as_str())))
        .collect();

    if ready.is_empty() {
        return Selection::Deadlocked;
    }

    ready.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
    let selected = ready[0].clone();

    if state.current_task_id.as_deref() == Some(selected.id.as_str()) {
        state.iterations += 1;
        if state.iterations >= max_iterations {
            return Selection::IterationLimit;
        }
    } else {
        state.current_task_id = Some(selected.id.clone());
    }

    Selection::Task(selected)
}

// ---------------------------------------------------------------------------
// Test command detection
// ---------------------------------------------------------------------------

/// Infer the project's test command from its build files.
pub fn detect_test_command(project_dir: &Path) -> Option<String> {
    if project_dir.join("package.json").exists() {
        return Some("npm test".to_string());
    }
    if project_dir.join("pyproject.toml").exists() || project_dir.join("pytest.ini").exists() {
        return Some("pytest".to_string());
    }
    if project_dir.join("Cargo.toml").exists() {
        return Some("cargo test".to_string());
    }
    if project_dir.join("go.mod").exists() {
        return Some("go test ./...".to_string());
    }
    None
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- none".to_string();
    }
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Task-scoped implementation prompt: file lists and acceptance criteria
/// only. Workflow-internal paths stay out of agent context.
pub fn build_task_prompt(task: &Task) -> String {
    format!(
        "Implement the following task.\n\n\
         TASK: {id}\n\
         TITLE: {title}\n\n\
         USER STORY:\n{story}\n\n\
         ACCEPTANCE CRITERIA:\n{criteria}\n\n\
         FILES TO CREATE:\n{create}\n\n\
         FILES TO MODIFY:\n{modify}\n\n\
         TEST FILES:\n{tests}\n\n\
         Write tests first, then implement until they pass. When done, \
         report as JSON: {{\"task_id\": \"{id}\", \"status\": \"completed\", \
         \"files_created\": [], \"files_modified\": [], \"tests_passed\": true, \
         \"notes\": \"...\"}}",
        id = task.id,
        title = task.title,
        story = task.user_story.as_deref().unwrap_or("(none)"),
        criteria = format_list(&task.acceptance_criteria),
        create = format_list(&task.files_to_create),
        modify = format_list(&task.files_to_modify),
        tests = format_list(&task.test_files),
    )
}

/// Bug-fix prompt carrying the captured error context.
pub fn build_fix_prompt(task: &Task, error: &str) -> String {
    let mut involved = task.files_to_create.clone();
    involved.extend(task.files_to_modify.iter().cloned());
    format!(
        "TASK: {id}\n\
         TITLE: {title}\n\n\
         FILES INVOLVED:\n{files}\n\n\
         TEST FILES:\n{tests}\n\n\
         ERROR TO FIX:\n{error}\n\n\
         Analyze the error and fix the code so the tests pass. Report as \
         JSON: {{\"fix_applied\": \"...\", \"files_modified\": []}}",
        id = task.id,
        title = task.title,
        files = format_list(&involved),
        tests = format_list(&task.test_files),
    )
}

// ---------------------------------------------------------------------------
// Implementation mode
// ---------------------------------------------------------------------------

/// Whether to run the iterative implement-until-tests-pass loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterativeMode {
    /// Iterative when the task declares test files.
    #[default]
    Auto,
    On,
    Off,
}

impl IterativeMode {
    pub fn should_iterate(&self, task: &Task) -> bool {
        match self {
            Self::Auto => !task.test_files.is_empty(),
            Self::On => true,
            Self::Off => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loop driver
// ---------------------------------------------------------------------------

/// Result of running the loop to quiescence.
#[derive(Debug, Clone, Default)]
pub struct TaskLoopReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub escalated: bool,
    pub iterations: u32,
}

/// Outcome of verifying one task.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Passed,
    Failed { output: String },
    /// No test command detected; verification skipped with a warning.
    Skipped,
}

/// Drives implement → verify → (fix-bug | complete) per task.
pub struct TaskLoop<'a> {
    pub pool: &'a PgPool,
    pub invoker: &'a AgentInvoker,
    pub enforcer: &'a BudgetEnforcer,
    pub sessions: &'a SessionManager,
    pub implementer: &'a dyn AgentCli,
    pub config: &'a ProjectConfig,
    pub project_dir: &'a Path,
    /// Where per-iteration outputs are written
    /// (`.workflow/phases/implementation`).
    pub output_dir: PathBuf,
    pub log: &'a ActionLog,
    pub iterative: IterativeMode,
}

impl TaskLoop<'_> {
    /// Run until every task is terminal, the iteration cap is hit, or the
    /// budget demands escalation.
    pub async fn run(&self) -> Result<TaskLoopReport> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;

        let mut state = TaskLoopState::default();
        let max_iterations = self.config.retry.max_task_loop_iterations;

        loop {
            let all_tasks = tasks::list_all_tasks(self.pool).await?;

            match select_next_task(&all_tasks, &mut state, max_iterations) {
                Selection::AllDone => {
                    return Ok(TaskLoopReport {
                        completed: state.completed,
                        failed: state.failed,
                        escalated: false,
                        iterations: state.iterations,
                    });
                }
                Selection::Deadlocked => {
                    // Mark unreachable pending tasks blocked so the phase
                    // can report them.
                    for task in all_tasks.iter().filter(|t| t.status == StepStatus::Pending) {
                        tasks::transition_status(
                            self.pool,
                            &task.id,
                            StepStatus::Pending,
                            StepStatus::Blocked,
                        )
                        .await?;
                        self.log.append(
                            ActionEntry::new(
                                ActionType::TaskBlocked,
                                format!("task {} blocked by unsatisfiable dependencies", task.id),
                            )
                            .task(task.id.clone()),
                        );
                    }
                    return Ok(TaskLoopReport {
                        completed: state.completed,
                        failed: state.failed,
                        escalated: true,
                        iterations: state.iterations,
                    });
                }
                Selection::IterationLimit => {
                    warn!(
                        iterations = state.iterations,
                        "task loop iteration cap reached, escalating"
                    );
                    self.log.append(ActionEntry::new(
                        ActionType::Escalation,
                        format!("task loop hit {max_iterations}-iteration cap"),
                    ));
                    return Ok(TaskLoopReport {
                        completed: state.completed,
                        failed: state.failed,
                        escalated: true,
                        iterations: state.iterations,
                    });
                }
                Selection::Task(task) => {
                    // Budget gate before any agent call for this task.
                    let estimate = self.enforcer.default_invocation_estimate();
                    match self.enforcer.can_spend(&task.id, estimate).await {
                        BudgetDecision::Abort => {
                            warn!(task_id = %task.id, "task budget exhausted, aborting loop");
                            self.log.append(
                                ActionEntry::new(
                                    ActionType::Escalation,
                                    format!("budget abort before task {}", task.id),
                                )
                                .task(task.id.clone()),
                            );
                            return Ok(TaskLoopReport {
                                completed: state.completed,
                                failed: state.failed,
                                escalated: true,
                                iterations: state.iterations,
                            });
                        }
                        BudgetDecision::Escalate => {
                            self.log.append(
                                ActionEntry::new(
                                    ActionType::Escalation,
                                    format!("budget escalation before task {}", task.id),
                                )
                                .task(task.id.clone()),
                            );
                            return Ok(TaskLoopReport {
                                completed: state.completed,
                                failed: state.failed,
                                escalated: true,
                                iterations: state.iterations,
                            });
                        }
                        BudgetDecision::Warn { at_percent } => {
                            warn!(task_id = %task.id, at_percent, "task budget warning");
                        }
                        BudgetDecision::Allow => {}
                    }

                    self.run_one_task(&task, &mut state).await?;
                }
            }
        }
    }

    /// Implement → verify → fix-bug for one selected task.
    async fn run_one_task(&self, task: &Task, state: &mut TaskLoopState) -> Result<()> {
        tasks::transition_status(self.pool, &task.id, StepStatus::Pending, StepStatus::InProgress)
            .await?;
        self.log.append(
            ActionEntry::new(ActionType::TaskStart, format!("implementing {}", task.id))
                .task(task.id.clone())
                .status(crate::actionlog::ActionStatus::Started),
        );

        let implement_ok = self.implement(task).await?;

        let verified = if implement_ok {
            match self.verify(task).await? {
                VerifyOutcome::Passed | VerifyOutcome::Skipped => true,
                VerifyOutcome::Failed { output } => self.fix_and_reverify(task, &output).await?,
            }
        } else {
            false
        };

        let mut updated = tasks::get_task(self.pool, &task.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {} disappeared mid-loop", task.id))?;

        if verified {
            tasks::transition_status(
                self.pool,
                &task.id,
                StepStatus::InProgress,
                StepStatus::Completed,
            )
            .await?;
            state.completed.push(task.id.clone());
            self.sessions.close(&task.id, self.implementer.name()).await?;
            self.cleanup_task_artifacts(&task.id);
            self.log.append(
                ActionEntry::new(ActionType::TaskComplete, format!("{} completed", task.id))
                    .task(task.id.clone()),
            );
        } else {
            updated.attempts += 1;
            tasks::update_task(self.pool, &updated).await?;
            tasks::transition_status(
                self.pool,
                &task.id,
                StepStatus::InProgress,
                StepStatus::Failed,
            )
            .await?;

            if updated.attempts < updated.max_attempts {
                // Back to pending: the next selection retries it (and the
                // iteration counter counts the re-selection).
                tasks::transition_status(
                    self.pool,
                    &task.id,
                    StepStatus::Failed,
                    StepStatus::Pending,
                )
                .await?;
                info!(task_id = %task.id, attempts = updated.attempts, "task failed, will retry");
            } else {
                state.failed.push(task.id.clone());
                self.sessions.close(&task.id, self.implementer.name()).await?;
                self.log.append(
                    ActionEntry::new(
                        ActionType::TaskFailed,
                        format!("{} failed after {} attempts", task.id, updated.attempts),
                    )
                    .task(task.id.clone())
                    .error_text(updated.error.clone().unwrap_or_default()),
                );
            }
        }

        Ok(())
    }

    /// Run the implementer, in single-shot or iterative mode.
    async fn implement(&self, task: &Task) -> Result<bool> {
        if self.iterative.should_iterate(task) && detect_test_command(self.project_dir).is_some() {
            self.implement_iterative(task).await
        } else {
            self.implement_once(task, 0).await
        }
    }

    async fn implement_once(&self, task: &Task, iteration: u32) -> Result<bool> {
        let session_args = self.sessions.cli_args(&task.id, self.implementer.name()).await?;
        let request = InvocationRequest {
            task_id: Some(task.id.clone()),
            prompt: build_task_prompt(task),
            session_args,
            timeout: None,
            max_cost_usd: None,
            allowed_tools: vec![
                "Read".to_string(),
                "Write".to_string(),
                "Edit".to_string(),
                "Glob".to_string(),
                "Grep".to_string(),
                "Bash".to_string(),
            ],
        };

        let result = self.invoker.invoke(self.implementer, &request).await;
        self.write_iteration_output(&task.id, iteration, &result.output);

        if !result.success {
            let mut updated = tasks::get_task(self.pool, &task.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("task {} disappeared", task.id))?;
            updated.error = result.error.clone();
            tasks::update_task(self.pool, &updated).await?;
            return Ok(false);
        }

        // Fold reported file lists into the task record via the reducer so
        // concurrent updates stay safe.
        if let Some(parsed) = &result.parsed {
            let current = tasks::get_task(self.pool, &task.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("task {} disappeared", task.id))?;
            let mut incoming = current.clone();
            incoming.files_created = string_list(parsed.get("files_created"));
            incoming.files_modified = string_list(parsed.get("files_modified"));
            if let Some(notes) = parsed.get("notes").and_then(|n| n.as_str()) {
                incoming.implementation_notes = Some(notes.to_string());
            }
            let merged = reducer::merge_task_fields(&current, &incoming);
            tasks::update_task(self.pool, &merged).await?;
        }

        Ok(true)
    }

    /// Iterative retry loop: re-invoke the implementer with fresh context
    /// each round until the test command passes or caps are hit.
    async fn implement_iterative(&self, task: &Task) -> Result<bool> {
        let max_rounds = self.config.retry.implementation_max_attempts.max(1) * 3;

        for round in 0..max_rounds {
            if !self.implement_once(task, round).await? {
                continue;
            }
            match self.verify(task).await? {
                VerifyOutcome::Passed | VerifyOutcome::Skipped => return Ok(true),
                VerifyOutcome::Failed { output } => {
                    info!(task_id = %task.id, round, "tests failing, iterating");
                    let mut updated = tasks::get_task(self.pool, &task.id)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("task {} disappeared", task.id))?;
                    updated.error = Some(truncate(&output, 2000));
                    tasks::update_task(self.pool, &updated).await?;
                }
            }
        }
        Ok(false)
    }

    /// Run the detected test command with a bounded wall clock.
    pub async fn verify(&self, task: &Task) -> Result<VerifyOutcome> {
        let Some(command) = detect_test_command(self.project_dir) else {
            warn!(task_id = %task.id, "no test command detected, skipping verification");
            return Ok(VerifyOutcome::Skipped);
        };

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(self.project_dir)
            .env_clear()
            .envs(crate::invoker::scrubbed_env())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn test command {command:?}"))?;

        let output =
            match tokio::time::timeout(Duration::from_secs(600), child.wait_with_output()).await {
                Ok(result) => result.context("failed to collect test output")?,
                Err(_) => {
                    return Ok(VerifyOutcome::Failed {
                        output: format!("test command {command:?} timed out"),
                    });
                }
            };

        if output.status.success() {
            let mut updated = tasks::get_task(self.pool, &task.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("task {} disappeared", task.id))?;
            updated.test_results = Some(serde_json::json!({"passed": true, "command": command}));
            tasks::update_task(self.pool, &updated).await?;
            Ok(VerifyOutcome::Passed)
        } else {
            let combined = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            Ok(VerifyOutcome::Failed {
                output: combined.trim().to_string(),
            })
        }
    }

    /// Invoke the bug-fixer with error context, then re-verify. Bounded
    /// retries before giving up on this attempt.
    async fn fix_and_reverify(&self, task: &Task, first_error: &str) -> Result<bool> {
        let mut last_error = first_error.to_string();
        let retries = task.max_attempts.max(1) as u32;

        for round in 0..retries {
            self.log.append(
                ActionEntry::new(
                    ActionType::AgentInvoke,
                    format!("bug-fix round {} for {}", round + 1, task.id),
                )
                .task(task.id.clone())
                .agent(self.implementer.name()),
            );

            let session_args = self.sessions.cli_args(&task.id, self.implementer.name()).await?;
            let request = InvocationRequest {
                task_id: Some(task.id.clone()),
                prompt: build_fix_prompt(task, &truncate(&last_error, 4000)),
                session_args,
                timeout: None,
                max_cost_usd: None,
                allowed_tools: vec![
                    "Read".to_string(),
                    "Write".to_string(),
                    "Edit".to_string(),
                    "Glob".to_string(),
                    "Grep".to_string(),
                    "Bash".to_string(),
                ],
            };
            let result = self.invoker.invoke(self.implementer, &request).await;
            if !result.success {
                last_error = result.error.unwrap_or_else(|| "bug fixer failed".to_string());
                continue;
            }

            match self.verify(task).await? {
                VerifyOutcome::Passed | VerifyOutcome::Skipped => return Ok(true),
                VerifyOutcome::Failed { output } => last_error = output,
            }
        }

        let mut updated = tasks::get_task(self.pool, &task.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {} disappeared", task.id))?;
        updated.error = Some(truncate(&last_error, 2000));
        tasks::update_task(self.pool, &updated).await?;
        Ok(false)
    }

    fn write_iteration_output(&self, task_id: &str, iteration: u32, output: &str) {
        let path = self.output_dir.join(format!("{task_id}-iter-{iteration}.log"));
        if let Err(e) = std::fs::write(&path, output) {
            warn!(path = %path.display(), error = %e, "failed to write iteration output");
        }
    }

    /// Remove transient per-iteration artifacts once a task completes.
    fn cleanup_task_artifacts(&self, task_id: &str) {
        let Ok(entries) = std::fs::read_dir(&self.output_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&format!("{task_id}-iter-"))
                && let Err(e) = std::fs::remove_file(entry.path())
            {
                warn!(error = %e, "failed to clean up iteration artifact");
            }
        }
    }
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

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use maestro_db::models::TaskPriority;

    fn make_task(id: &str, status: StepStatus, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            user_story: None,
            acceptance_criteria: vec![],
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            files_to_create: vec![format!("src/{id}.rs")],
            files_to_modify: vec![],
            test_files: vec![],
            files_created: vec![],
            files_modified: vec![],
            test_results: None,
            status,
            priority: TaskPriority::Medium,
            attempts: 0,
            max_attempts: 3,
            implementation_notes: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn new_task_selection_does_not_increment() {
        let tasks = vec![
            make_task("T1", StepStatus::Pending, &[]),
            make_task("T2", StepStatus::Pending, &[]),
        ];
        let mut state = TaskLoopState {
            iterations: 5,
            ..Default::default()
        };

        match select_next_task(&tasks, &mut state, 50) {
            Selection::Task(t) => assert_eq!(t.id, "T1"),
            other => panic!("expected a task, got {other:?}"),
        }
        assert_eq!(state.iterations, 5);
    }

    #[test]
    fn same_task_retry_increments() {
        let tasks = vec![make_task("T1", StepStatus::Pending, &[])];
        let mut state = TaskLoopState {
            current_task_id: Some("T1".to_string()),
            iterations: 5,
            ..Default::default()
        };

        match select_next_task(&tasks, &mut state, 50) {
            Selection::Task(t) => assert_eq!(t.id, "T1"),
            other => panic!("expected a task, got {other:?}"),
        }
        assert_eq!(state.iterations, 6);
    }

    #[test]
    fn switching_tasks_does_not_increment() {
        let tasks = vec![make_task("T2", StepStatus::Pending, &[])];
        let mut state = TaskLoopState {
            current_task_id: Some("T1".to_string()),
            iterations: 10,
            ..Default::default()
        };

        match select_next_task(&tasks, &mut state, 50) {
            Selection::Task(t) => assert_eq!(t.id, "T2"),
            other => panic!("expected a task, got {other:?}"),
        }
        assert_eq!(state.iterations, 10);
    }

    #[test]
    fn fifty_sequential_tasks_never_exhaust_the_cap() {
        let mut state = TaskLoopState::default();
        for i in 1..=50 {
            let id = format!("T{i}");
            let tasks = vec![make_task(&id, StepStatus::Pending, &[])];
            match select_next_task(&tasks, &mut state, 50) {
                Selection::Task(t) => assert_eq!(t.id, id),
                other => panic!("expected task {id}, got {other:?}"),
            }
        }
        assert_eq!(state.iterations, 0);
    }

    #[test]
    fn iteration_cap_fires_on_repeated_retry() {
        let tasks = vec![make_task("T1", StepStatus::Pending, &[])];
        let mut state = TaskLoopState {
            current_task_id: Some("T1".to_string()),
            iterations: 49,
            ..Default::default()
        };
        assert_eq!(select_next_task(&tasks, &mut state, 50), Selection::IterationLimit);
    }

    #[test]
    fn dependencies_gate_readiness() {
        let tasks = vec![
            make_task("T1", StepStatus::Pending, &[]),
            make_task("T2", StepStatus::Pending, &["T1"]),
        ];
        let mut state = TaskLoopState::default();
        match select_next_task(&tasks, &mut state, 50) {
            Selection::Task(t) => assert_eq!(t.id, "T1"),
            other => panic!("expected T1, got {other:?}"),
        }

        let tasks = vec![
            make_task("T1", StepStatus::Completed, &[]),
            make_task("T2", StepStatus::Pending, &["T1"]),
        ];
        let mut state = TaskLoopState::default();
        match select_next_task(&tasks, &mut state, 50) {
            Selection::Task(t) => assert_eq!(t.id, "T2"),
            other => panic!("expected T2, got {other:?}"),
        }
    }

    #[test]
    fn all_terminal_is_all_done() {
        let tasks = vec![
            make_task("T1", StepStatus::Completed, &[]),
            make_task("T2", StepStatus::Failed, &[]),
        ];
        let mut state = TaskLoopState::default();
        assert_eq!(select_next_task(&tasks, &mut state, 50), Selection::AllDone);
    }

    #[test]
    fn unsatisfiable_dependencies_deadlock() {
        let tasks = vec![
            make_task("T1", StepStatus::Failed, &[]),
            make_task("T2", StepStatus::Pending, &["T1"]),
        ];
        let mut state = TaskLoopState::default();
        assert_eq!(select_next_task(&tasks, &mut state, 50), Selection::Deadlocked);
    }

    #[test]
    fn priority_beats_creation_order() {
        let mut early_low = make_task("T1", StepStatus::Pending, &[]);
        early_low.priority = TaskPriority::Low;
        early_low.created_at = Utc::now() - TimeDelta::hours(1);
        let mut late_high = make_task("T2", StepStatus::Pending, &[]);
        late_high.priority = TaskPriority::High;

        let mut state = TaskLoopState::default();
        match select_next_task(&[early_low, late_high], &mut state, 50) {
            Selection::Task(t) => assert_eq!(t.id, "T2"),
            other => panic!("expected T2, got {other:?}"),
        }
    }

    #[test]
    fn detect_test_command_by_build_file() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(detect_test_command(tmp.path()), None);

        std::fs::write(tmp.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(detect_test_command(tmp.path()), Some("cargo test".to_string()));

        std::fs::write(tmp.path().join("package.json"), "{}\n").unwrap();
        assert_eq!(detect_test_command(tmp.path()), Some("npm test".to_string()));
    }

    #[test]
    fn task_prompt_is_scoped_to_the_task() {
        let mut task = make_task("T3", StepStatus::Pending, &[]);
        task.acceptance_criteria = vec!["widget renders".to_string()];
        task.user_story = Some("As a user I want widgets".to_string());

        let prompt = build_task_prompt(&task);
        assert!(prompt.contains("TASK: T3"));
        assert!(prompt.contains("widget renders"));
        assert!(prompt.contains("src/T3.rs"));
        // No workflow internals leak into agent context.
        assert!(!prompt.contains(".workflow"));
        assert!(!prompt.contains("state.json"));
    }

    #[test]
    fn iterative_mode_auto_keys_on_test_files() {
        let mut task = make_task("T1", StepStatus::Pending, &[]);
        assert!(!IterativeMode::Auto.should_iterate(&task));
        task.test_files = vec!["tests/t1.rs".to_string()];
        assert!(IterativeMode::Auto.should_iterate(&task));
        assert!(IterativeMode::On.should_iterate(&make_task("T2", StepStatus::Pending, &[])));
        assert!(!IterativeMode::Off.should_iterate(&task));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let long = "αβγδε".repeat(100);
        let cut = truncate(&long, 7);
        assert!(cut.len() <= 10);
    }
}
