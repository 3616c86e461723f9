//! End-to-end workflow tests with fake agent CLIs.
//!
//! Agent binaries are shell scripts that answer by prompt shape: the
//! planner prompt gets a plan, the implementer prompt writes a source
//! file and reports completion, reviewer prompts get approvals. Each test
//! gets its own database (testcontainers) and its own git repository.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use maestro_core::agents::{AgentCli, ClaudeCli, CursorCli, GeminiCli};
use maestro_core::orchestrator::Orchestrator;
use maestro_core::runner::{RunEnd, RunOptions, is_success};
use maestro_db::models::{ExecutionMode, StepStatus};
use maestro_db::queries::{tasks, workflow};
use maestro_test_utils::TestDb;

const PRODUCT_SPEC: &str = "# Hello Feature\n\n\
    ## Summary\nPrint a greeting.\n\n\
    ## Problem Statement\nNo greeting exists.\n\n\
    ## Acceptance Criteria\n- hello.rs exists\n\n\
    ## Examples\n`hello`\n\n\
    ## Technical Constraints\n- Rust\n\n\
    ## Testing Strategy\nManual.\n\n\
    ## Definition of Done\nReviewed and committed.\n";

/// The combined planner/implementer script. Dispatches on the prompt
/// (argv[2], after `-p`).
const CLAUDE_SCRIPT: &str = r#"#!/bin/sh
prompt="$2"
case "$prompt" in
  *"senior software architect"*)
    cat <<'EOF'
{"plan_name":"hello","summary":"Print a greeting.","tasks":[{"id":"T1","title":"Write hello","user_story":"As a user I want a greeting","acceptance_criteria":["hello.rs exists"],"dependencies":[],"files_to_create":["hello.rs"],"files_to_modify":[],"test_files":[],"priority":"high"}],"risks":[]}
EOF
    ;;
  *"Implement the following task"*)
    echo 'fn main() { println!("hello"); }' > hello.rs
    echo '{"task_id":"T1","status":"completed","files_created":["hello.rs"],"files_modified":[],"tests_passed":true,"notes":"done","total_cost_usd":0.01}'
    ;;
  *)
    echo '{"result":"ok"}'
    ;;
esac
"#;

const APPROVE_SCRIPT: &str = r#"#!/bin/sh
echo '{"reviewer":"reviewer","overall_assessment":"approve","score":8.5,"strengths":["clear"],"concerns":[],"blocking_issues":[]}'
"#;

const REJECT_SCRIPT: &str = r#"#!/bin/sh
echo '{"reviewer":"reviewer","overall_assessment":"reject","score":3.0,"blocking_issues":["no error handling"]}'
"#;

const HANG_SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  --version) exit 0 ;;
esac
sleep 600
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn init_git_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
        assert!(output.status.success(), "git {} failed", args.join(" "));
    };
    run(&["init"]);
    run(&["config", "user.email", "test@maestro.dev"]);
    run(&["config", "user.name", "Maestro Test"]);
    run(&["add", "."]);
    run(&["commit", "-m", "initial commit"]);
}

struct Harness {
    orchestrator: Orchestrator,
    project_dir: tempfile::TempDir,
    db: TestDb,
}

async fn setup(
    claude_script: &str,
    cursor_script: &str,
    gemini_script: &str,
    project_config: Option<&str>,
) -> Harness {
    let db = TestDb::create().await;

    let project_dir = tempfile::tempdir().unwrap();
    std::fs::write(project_dir.path().join("PRODUCT.md"), PRODUCT_SPEC).unwrap();
    if let Some(config) = project_config {
        std::fs::write(project_dir.path().join(".project-config.json"), config).unwrap();
    }
    init_git_repo(project_dir.path());

    let scripts = tempfile::tempdir().unwrap();
    let claude = write_script(scripts.path(), "fake_claude.sh", claude_script);
    let cursor = write_script(scripts.path(), "fake_cursor.sh", cursor_script);
    let gemini = write_script(scripts.path(), "fake_gemini.sh", gemini_script);
    // The scripts dir must outlive the orchestrator; leak it for the test.
    std::mem::forget(scripts);

    let claude: Arc<dyn AgentCli> = Arc::new(ClaudeCli::with_binary(claude.to_str().unwrap()));
    let cursor: Arc<dyn AgentCli> = Arc::new(CursorCli::with_binary(cursor.to_str().unwrap()));
    let gemini: Arc<dyn AgentCli> = Arc::new(GeminiCli::with_binary(gemini.to_str().unwrap()));

    let orchestrator = Orchestrator::with_agents(
        db.pool.clone(),
        project_dir.path().to_path_buf(),
        claude,
        cursor,
        gemini,
    )
    .unwrap();

    Harness {
        orchestrator,
        project_dir,
        db,
    }
}

async fn teardown(harness: Harness) {
    harness.db.close().await;
}

#[tokio::test]
async fn happy_path_completes_all_five_phases() {
    let harness = setup(CLAUDE_SCRIPT, APPROVE_SCRIPT, APPROVE_SCRIPT, None).await;

    let report = harness
        .orchestrator
        .run(RunOptions::default(), ExecutionMode::Afk)
        .await
        .unwrap();
    assert_eq!(report.end, RunEnd::Succeeded);

    // Success predicate over persisted state.
    let state = workflow::get_state(&harness.db.pool).await.unwrap().unwrap();
    assert!(is_success(&state));

    // All five phases completed.
    let phase_map = maestro_core::phases::decode_phase_map(&state.phase_status);
    for phase in 1..=5 {
        assert_eq!(
            phase_map[&phase].status,
            StepStatus::Completed,
            "phase {phase} should be completed"
        );
    }

    // Five auto-commits, one per phase.
    let commits = state.git_commits.as_array().unwrap();
    assert_eq!(commits.len(), 5);
    let phases: Vec<i64> = commits
        .iter()
        .map(|c| c["phase"].as_i64().unwrap())
        .collect();
    assert_eq!(phases, vec![1, 2, 3, 4, 5]);

    // The implementer's work is merged and committed.
    assert!(harness.project_dir.path().join("hello.rs").exists());

    // Task terminal state.
    let task = tasks::get_task(&harness.db.pool, "T1").await.unwrap().unwrap();
    assert_eq!(task.status, StepStatus::Completed);
    assert!(task.files_created.contains(&"hello.rs".to_string()));

    // Completion artifacts.
    let summary_path = harness
        .project_dir
        .path()
        .join(".workflow/phases/completion/completion-summary.json");
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(summary["approved"], true);
    assert_eq!(summary["tasks"]["completed"], 1);
    assert_eq!(summary["tasks"]["failed"], 0);

    // Handoff brief exists.
    assert!(
        harness
            .project_dir
            .path()
            .join(".workflow/handoff_brief.md")
            .exists()
    );

    teardown(harness).await;
}

#[tokio::test]
async fn end_phase_one_routes_to_completion_after_planning() {
    let harness = setup(CLAUDE_SCRIPT, APPROVE_SCRIPT, APPROVE_SCRIPT, None).await;

    let report = harness
        .orchestrator
        .run(
            RunOptions {
                end_phase: 1,
                ..RunOptions::default()
            },
            ExecutionMode::Afk,
        )
        .await
        .unwrap();
    assert_eq!(report.end, RunEnd::Succeeded);

    let state = workflow::get_state(&harness.db.pool).await.unwrap().unwrap();
    assert!(is_success(&state));

    let phase_map = maestro_core::phases::decode_phase_map(&state.phase_status);
    assert_eq!(phase_map[&1].status, StepStatus::Completed);
    assert_eq!(phase_map[&5].status, StepStatus::Completed);
    // Validation through verification never ran.
    for phase in 2..=4 {
        assert_eq!(phase_map[&phase].status, StepStatus::Pending);
    }

    // No reviewer feedback was gathered.
    assert!(state.validation_feedback.is_none());

    // Tasks were planned but never implemented.
    let task = tasks::get_task(&harness.db.pool, "T1").await.unwrap().unwrap();
    assert_eq!(task.status, StepStatus::Pending);

    teardown(harness).await;
}

#[tokio::test]
async fn double_rejection_escalates_after_retry_budget() {
    // One retry allowed, then escalation; AFK mode makes that an abort.
    let config = r#"{"validation": {"maxPhaseRetries": 1}}"#;
    let harness = setup(CLAUDE_SCRIPT, REJECT_SCRIPT, REJECT_SCRIPT, Some(config)).await;

    let report = harness
        .orchestrator
        .run(RunOptions::default(), ExecutionMode::Afk)
        .await
        .unwrap();
    assert_eq!(report.end, RunEnd::Aborted { at_phase: 2 });

    let state = workflow::get_state(&harness.db.pool).await.unwrap().unwrap();
    assert!(!is_success(&state));
    // Rejection incremented the plan iteration counter.
    assert!(state.iteration_count >= 1);

    // The handoff brief names the blocker.
    let brief = std::fs::read_to_string(
        harness.project_dir.path().join(".workflow/handoff_brief.md"),
    )
    .unwrap();
    assert!(brief.contains("## Blockers"));

    teardown(harness).await;
}

#[tokio::test]
async fn hung_reviewer_falls_back_to_single_agent_approval() {
    // Gemini hangs; cursor approves at 8.5. With the 1.0 penalty the
    // adjusted 7.5 meets the single-agent minimum exactly, so validation
    // still passes within the 2-second unified timeout.
    let config = r#"{"review": {"reviewerTimeoutSeconds": 2}}"#;
    let harness = setup(CLAUDE_SCRIPT, APPROVE_SCRIPT, HANG_SCRIPT, Some(config)).await;

    let report = harness
        .orchestrator
        .run(RunOptions::default(), ExecutionMode::Afk)
        .await
        .unwrap();
    assert_eq!(report.end, RunEnd::Succeeded);

    // The gemini slot carries an explicit failure, not a missing value.
    let gemini_feedback: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(
            harness
                .project_dir
                .path()
                .join(".workflow/phases/validation/gemini-feedback.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert!(
        gemini_feedback["error"]
            .as_str()
            .unwrap()
            .contains("timed out")
    );

    // Approval recorded the single-agent path.
    let approval: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(
            harness
                .project_dir
                .path()
                .join(".workflow/phases/validation/approval-result.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(approval["single_agent"], "cursor");
    assert_eq!(approval["approved"], true);

    teardown(harness).await;
}

#[tokio::test]
async fn hitl_mode_pauses_instead_of_aborting() {
    let config = r#"{"validation": {"maxPhaseRetries": 1}}"#;
    let harness = setup(CLAUDE_SCRIPT, REJECT_SCRIPT, REJECT_SCRIPT, Some(config)).await;

    let report = harness
        .orchestrator
        .run(RunOptions::default(), ExecutionMode::Hitl)
        .await
        .unwrap();
    assert_eq!(report.end, RunEnd::Paused { at_phase: 2 });

    teardown(harness).await;
}

#[tokio::test]
async fn resume_restarts_from_first_incomplete_phase() {
    let harness = setup(CLAUDE_SCRIPT, APPROVE_SCRIPT, APPROVE_SCRIPT, None).await;

    // Run planning only.
    let report = harness
        .orchestrator
        .run(
            RunOptions {
                end_phase: 1,
                ..RunOptions::default()
            },
            ExecutionMode::Afk,
        )
        .await
        .unwrap();
    assert_eq!(report.end, RunEnd::Succeeded);

    // Resume picks up at validation (the first non-completed phase) and
    // honors the stored end_phase: after validation it routes straight
    // back to completion.
    let report = harness.orchestrator.resume(ExecutionMode::Afk).await.unwrap();
    assert_eq!(report.end, RunEnd::Succeeded);

    let state = workflow::get_state(&harness.db.pool).await.unwrap().unwrap();
    let phase_map = maestro_core::phases::decode_phase_map(&state.phase_status);
    assert_eq!(phase_map[&2].status, StepStatus::Completed);
    assert_eq!(phase_map[&3].status, StepStatus::Pending);

    teardown(harness).await;
}

#[tokio::test]
async fn missing_spec_fails_prerequisites_before_any_agent_call() {
    let db = TestDb::create().await;
    let project_dir = tempfile::tempdir().unwrap();
    // No PRODUCT.md, docs discovery off.
    std::fs::write(
        project_dir.path().join(".project-config.json"),
        r#"{"workflow": {"features": {"documentationDiscovery": false}}}"#,
    )
    .unwrap();
    init_git_repo(project_dir.path());

    let scripts = tempfile::tempdir().unwrap();
    let claude = write_script(scripts.path(), "fake_claude.sh", CLAUDE_SCRIPT);
    let cursor = write_script(scripts.path(), "fake_cursor.sh", APPROVE_SCRIPT);
    let gemini = write_script(scripts.path(), "fake_gemini.sh", APPROVE_SCRIPT);

    let orchestrator = Orchestrator::with_agents(
        db.pool.clone(),
        project_dir.path().to_path_buf(),
        Arc::new(ClaudeCli::with_binary(claude.to_str().unwrap())),
        Arc::new(CursorCli::with_binary(cursor.to_str().unwrap())),
        Arc::new(GeminiCli::with_binary(gemini.to_str().unwrap())),
    )
    .unwrap();

    let result = orchestrator.run(RunOptions::default(), ExecutionMode::Afk).await;
    assert!(result.is_err());
    assert!(format!("{:#}", result.unwrap_err()).contains("PRODUCT.md"));

    // No audit entries: nothing was invoked.
    let entries = maestro_db::queries::audit::list_entries(&db.pool, 10, 0, "created_at", true)
        .await
        .unwrap();
    assert!(entries.is_empty());

    db.close().await;
}
