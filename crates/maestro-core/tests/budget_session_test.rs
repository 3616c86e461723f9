//! Integration tests for budget enforcement and session continuity
//! against real storage.

use maestro_core::budget::{BudgetDecision, BudgetEnforcer};
use maestro_core::config::BudgetConfig;
use maestro_core::session::SessionManager;
use maestro_db::queries::budget::NewBudgetRecord;
use maestro_test_utils::TestDb;

fn spend(task: &str, cost: f64) -> NewBudgetRecord {
    NewBudgetRecord {
        task_id: task.to_string(),
        agent: "claude".to_string(),
        cost_usd: cost,
        tokens_input: None,
        tokens_output: None,
        model: None,
    }
}

#[tokio::test]
async fn budget_boundary_89_percent_warns_90_escalates() {
    let db = TestDb::create().await;
    let enforcer = BudgetEnforcer::new(
        db.pool.clone(),
        BudgetConfig {
            task_budget_usd: Some(10.0),
            ..Default::default()
        },
    );

    enforcer.record_spend(&spend("T1", 8.80)).await.unwrap();

    // 8.80 + 0.10 = 8.90 -> 89%: warn, not escalate.
    match enforcer.can_spend("T1", 0.10).await {
        BudgetDecision::Warn { at_percent } => assert_eq!(at_percent, 89),
        other => panic!("expected Warn at 89%, got {other:?}"),
    }

    // 8.80 + 0.20 = 9.00 -> 90%: escalate.
    assert_eq!(enforcer.can_spend("T1", 0.20).await, BudgetDecision::Escalate);

    // 8.80 + 1.20 = 10.00 -> 100%: abort.
    assert_eq!(enforcer.can_spend("T1", 1.20).await, BudgetDecision::Abort);

    db.close().await;
}

#[tokio::test]
async fn project_budget_combines_with_task_budget() {
    let db = TestDb::create().await;
    let enforcer = BudgetEnforcer::new(
        db.pool.clone(),
        BudgetConfig {
            task_budget_usd: Some(100.0),
            project_budget_usd: Some(10.0),
            ..Default::default()
        },
    );

    // Spend spread over other tasks still counts against the project.
    enforcer.record_spend(&spend("T1", 5.0)).await.unwrap();
    enforcer.record_spend(&spend("T2", 4.5)).await.unwrap();

    // T3 has no task spend at all, but the project is at 95%.
    assert_eq!(enforcer.can_spend("T3", 0.1).await, BudgetDecision::Escalate);

    db.close().await;
}

#[tokio::test]
async fn storage_failure_escalates_never_allows() {
    let db = TestDb::create().await;
    let enforcer = BudgetEnforcer::new(
        db.pool.clone(),
        BudgetConfig {
            task_budget_usd: Some(10.0),
            ..Default::default()
        },
    );

    // Closing the pool makes every query fail; the enforcer must
    // escalate, not silently allow.
    db.pool.close().await;
    assert_eq!(enforcer.can_spend("T1", 0.01).await, BudgetDecision::Escalate);

    db.close().await;
}

#[tokio::test]
async fn unlimited_budget_allows_everything() {
    let db = TestDb::create().await;
    let enforcer = BudgetEnforcer::new(db.pool.clone(), BudgetConfig::default());

    enforcer.record_spend(&spend("T1", 10_000.0)).await.unwrap();
    assert_eq!(enforcer.can_spend("T1", 500.0).await, BudgetDecision::Allow);

    db.close().await;
}

#[tokio::test]
async fn get_or_create_is_idempotent_until_closed() {
    let db = TestDb::create().await;
    let manager = SessionManager::new(db.pool.clone());

    let first = manager.get_or_create("T1", "claude").await.unwrap();
    let second = manager.get_or_create("T1", "claude").await.unwrap();
    assert_eq!(first.id, second.id);

    // Close, then a fresh id.
    assert!(manager.close("T1", "claude").await.unwrap());
    let third = manager.get_or_create("T1", "claude").await.unwrap();
    assert_ne!(first.id, third.id);
    assert!(third.id.starts_with("T1-"));

    db.close().await;
}

#[tokio::test]
async fn cli_args_switch_from_session_id_to_resume() {
    let db = TestDb::create().await;
    let manager = SessionManager::new(db.pool.clone());

    // First invocation: a fresh session gets --session-id.
    let args = manager.cli_args("T1", "claude").await.unwrap();
    assert_eq!(args[0], "--session-id");
    let id = args[1].clone();

    // After the session has been used once, later calls resume it.
    manager.touch(&id, 0.01).await.unwrap();
    let args = manager.cli_args("T1", "claude").await.unwrap();
    assert_eq!(args, vec!["--resume".to_string(), id]);

    db.close().await;
}

#[tokio::test]
async fn sessions_are_scoped_per_agent() {
    let db = TestDb::create().await;
    let manager = SessionManager::new(db.pool.clone());

    let claude = manager.get_or_create("T1", "claude").await.unwrap();
    let gemini = manager.get_or_create("T1", "gemini").await.unwrap();
    assert_ne!(claude.id, gemini.id);

    // Closing one agent's session leaves the other active.
    manager.close("T1", "claude").await.unwrap();
    let gemini_again = manager.get_or_create("T1", "gemini").await.unwrap();
    assert_eq!(gemini.id, gemini_again.id);

    db.close().await;
}

#[tokio::test]
async fn expired_sessions_are_closed_by_cleanup() {
    let db = TestDb::create().await;
    // TTL of zero hours: everything is immediately expired.
    let manager = SessionManager::with_ttl_hours(db.pool.clone(), 0);

    manager.get_or_create("T1", "claude").await.unwrap();
    manager.get_or_create("T2", "claude").await.unwrap();

    let closed = manager.cleanup_expired().await.unwrap();
    assert_eq!(closed, 2);

    // Cleanup is advisory: new sessions can be created immediately.
    let fresh = manager.get_or_create("T1", "claude").await.unwrap();
    assert_eq!(fresh.invocation_count, 0);

    db.close().await;
}
