//! Integration tests for the agent invoker: audit trail, timeouts,
//! environment scrubbing, session capture.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use maestro_core::agents::{ClaudeCli, InvocationRequest};
use maestro_core::budget::BudgetEnforcer;
use maestro_core::config::BudgetConfig;
use maestro_core::invoker::{AgentInvoker, ParsedKind};
use maestro_core::session::SessionManager;
use maestro_db::models::InvocationStatus;
use maestro_db::queries::{audit, budget, sessions};
use maestro_test_utils::TestDb;

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake_agent.sh");
    std::fs::write(&path, body).unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn invoker(pool: &sqlx::PgPool, working_dir: &Path, limits: BudgetConfig) -> AgentInvoker {
    AgentInvoker::new(
        pool.clone(),
        BudgetEnforcer::new(pool.clone(), limits),
        SessionManager::new(pool.clone()),
        working_dir.to_path_buf(),
    )
}

fn request(prompt: &str, task: Option<&str>) -> InvocationRequest {
    InvocationRequest {
        task_id: task.map(str::to_string),
        prompt: prompt.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn successful_invocation_records_full_audit_entry() {
    let db = TestDb::create().await;
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(
        tmp.path(),
        "#!/bin/sh\necho '{\"result\":\"ok\",\"total_cost_usd\":0.05,\"model\":\"sonnet\",\"usage\":{\"input_tokens\":100,\"output_tokens\":20}}'\n",
    );

    let invoker = invoker(&db.pool, tmp.path(), BudgetConfig::default());
    let cli = ClaudeCli::with_binary(script.to_str().unwrap());

    let result = invoker.invoke(&cli, &request("do the thing", Some("T1"))).await;
    assert!(result.success);
    assert_eq!(result.parsed_kind, ParsedKind::Json);
    assert_eq!(result.cost_usd, Some(0.05));

    let entries = audit::list_entries(&db.pool, 10, 0, "created_at", true).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.agent, "claude");
    assert_eq!(entry.task_id.as_deref(), Some("T1"));
    assert_eq!(entry.status, InvocationStatus::Success);
    assert_eq!(entry.parsed_output_type, "json");
    assert_eq!(entry.exit_code, Some(0));
    assert_eq!(entry.cost_usd, Some(0.05));
    assert_eq!(entry.model.as_deref(), Some("sonnet"));
    // The prompt itself is never stored, only its hash and length.
    assert_eq!(entry.prompt_length, "do the thing".len() as i64);
    assert_eq!(entry.prompt_hash.len(), 64);
    assert!(entry.command_args.iter().any(|a| a == "do the thing"));

    // The reported cost landed in the budget ledger.
    let spent = budget::task_spent(&db.pool, "T1").await.unwrap();
    assert!((spent - 0.05).abs() < 1e-9);

    db.close().await;
}

#[tokio::test]
async fn timeout_marks_audit_entry_and_is_retryable() {
    let db = TestDb::create().await;
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "#!/bin/sh\nsleep 600\n");

    let invoker = invoker(&db.pool, tmp.path(), BudgetConfig::default());
    let cli = ClaudeCli::with_binary(script.to_str().unwrap());

    let mut req = request("slow work", Some("T1"));
    req.timeout = Some(Duration::from_millis(300));
    let result = invoker.invoke(&cli, &req).await;

    assert!(!result.success);
    assert!(result.retryable);
    assert_eq!(result.status, InvocationStatus::Timeout);
    assert!(result.error.as_deref().unwrap().contains("timed out"));

    let entries = audit::list_entries(&db.pool, 10, 0, "created_at", true).await.unwrap();
    assert_eq!(entries[0].status, InvocationStatus::Timeout);

    db.close().await;
}

#[tokio::test]
async fn nonzero_exit_returns_stderr() {
    let db = TestDb::create().await;
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "#!/bin/sh\necho 'rate limit exceeded' >&2\nexit 1\n");

    let invoker = invoker(&db.pool, tmp.path(), BudgetConfig::default());
    let cli = ClaudeCli::with_binary(script.to_str().unwrap());

    let result = invoker.invoke(&cli, &request("work", Some("T1"))).await;
    assert!(!result.success);
    assert!(result.retryable, "rate limit errors are retryable");
    assert!(result.error.as_deref().unwrap().contains("rate limit"));
    assert_eq!(result.exit_code, Some(1));

    let entries = audit::list_entries(&db.pool, 10, 0, "created_at", true).await.unwrap();
    assert_eq!(entries[0].status, InvocationStatus::Failed);
    assert_eq!(entries[0].exit_code, Some(1));

    db.close().await;
}

#[tokio::test]
async fn unparseable_output_is_partial_success() {
    let db = TestDb::create().await;
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(tmp.path(), "#!/bin/sh\necho 'just some prose, no json'\n");

    let invoker = invoker(&db.pool, tmp.path(), BudgetConfig::default());
    let cli = ClaudeCli::with_binary(script.to_str().unwrap());

    let result = invoker.invoke(&cli, &request("work", None)).await;
    assert!(result.success);
    assert!(result.retryable);
    assert_eq!(result.parsed_kind, ParsedKind::None);
    assert!(result.parsed.is_none());

    let entries = audit::list_entries(&db.pool, 10, 0, "created_at", true).await.unwrap();
    assert_eq!(entries[0].parsed_output_type, "none");

    db.close().await;
}

#[tokio::test]
async fn json_is_extracted_from_noisy_output() {
    let db = TestDb::create().await;
    let tmp = tempfile::tempdir().unwrap();
    let script = write_script(
        tmp.path(),
        "#!/bin/sh\necho 'thinking...'\necho 'Result: {\"answer\": 42}'\necho 'done'\n",
    );

    let invoker = invoker(&db.pool, tmp.path(), BudgetConfig::default());
    let cli = ClaudeCli::with_binary(script.to_str().unwrap());

    let result = invoker.invoke(&cli, &request("work", None)).await;
    assert!(result.success);
    assert_eq!(result.parsed_kind, ParsedKind::ExtractedJson);
    assert_eq!(result.parsed.unwrap()["answer"], 42);

    db.close().await;
}

#[tokio::test]
async fn database_secrets_do_not_leak_into_child_env() {
    let db = TestDb::create().await;
    let tmp = tempfile::tempdir().unwrap();
    // The script echoes what it sees of the secret variables.
    let script = write_script(
        tmp.path(),
        "#!/bin/sh\necho \"{\\\"pgpassword\\\": \\\"$PGPASSWORD\\\", \\\"db_url\\\": \\\"$MAESTRO_DATABASE_URL\\\", \\\"term\\\": \\\"$TERM\\\"}\"\n",
    );

    // SAFETY: test-only env mutation; no other thread in this test binary
    // reads these variables concurrently.
    unsafe {
        std::env::set_var("PGPASSWORD", "super-secret");
        std::env::set_var("MAESTRO_DATABASE_URL", "postgresql://user:pw@host/db");
    }

    let invoker = invoker(&db.pool, tmp.path(), BudgetConfig::default());
    let cli = ClaudeCli::with_binary(script.to_str().unwrap());
    let result = invoker.invoke(&cli, &request("env probe", None)).await;

    unsafe {
        std::env::remove_var("PGPASSWORD");
        std::env::remove_var("MAESTRO_DATABASE_URL");
    }

    let parsed = result.parsed.expect("probe output should parse");
    assert_eq!(parsed["pgpassword"], "");
    assert_eq!(parsed["db_url"], "");
    assert_eq!(parsed["term"], "dumb");

    db.close().await;
}

#[tokio::test]
async fn session_id_in_output_updates_session_record() {
    let db = TestDb::create().await;
    let tmp = tempfile::tempdir().unwrap();

    // Seed a session, then have the agent echo its id back.
    let manager = SessionManager::new(db.pool.clone());
    let session = manager.get_or_create("T1", "claude").await.unwrap();
    let script_body = format!(
        "#!/bin/sh\necho '{{\"result\":\"ok\",\"session_id\":\"{}\",\"total_cost_usd\":0.02}}'\n",
        session.id
    );
    let script = write_script(tmp.path(), &script_body);

    let invoker = invoker(&db.pool, tmp.path(), BudgetConfig::default());
    let cli = ClaudeCli::with_binary(script.to_str().unwrap());
    let result = invoker.invoke(&cli, &request("continue work", Some("T1"))).await;
    assert_eq!(result.session_id.as_deref(), Some(session.id.as_str()));

    // The session was touched: invocation count and cost moved.
    let updated = sessions::get_session(&db.pool, &session.id).await.unwrap().unwrap();
    assert_eq!(updated.invocation_count, 1);
    assert!((updated.total_cost_usd - 0.02).abs() < 1e-9);

    // And the audit entry points at the session.
    let entries = audit::list_entries(&db.pool, 10, 0, "created_at", true).await.unwrap();
    assert_eq!(entries[0].session_id.as_deref(), Some(session.id.as_str()));

    db.close().await;
}

#[tokio::test]
async fn per_invocation_ceiling_refuses_before_spawn() {
    let db = TestDb::create().await;
    let tmp = tempfile::tempdir().unwrap();
    // A script that would create a marker file if it ever ran.
    let marker = tmp.path().join("ran");
    let script_body = format!("#!/bin/sh\ntouch {}\necho '{{}}'\n", marker.display());
    let script = write_script(tmp.path(), &script_body);

    let limits = BudgetConfig {
        per_invocation_usd: Some(0.10),
        ..Default::default()
    };
    let invoker = invoker(&db.pool, tmp.path(), limits);
    let cli = ClaudeCli::with_binary(script.to_str().unwrap());

    let mut req = request("expensive work", Some("T1"));
    req.max_cost_usd = Some(5.0);
    let result = invoker.invoke(&cli, &req).await;

    assert!(!result.success);
    assert!(!result.retryable);
    assert!(result.error.as_deref().unwrap().contains("ceiling"));
    assert!(!marker.exists(), "agent must not be spawned past the ceiling");

    db.close().await;
}
