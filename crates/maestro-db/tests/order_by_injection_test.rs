//! Regression tests for `order_by` injection hardening.
//!
//! Hostile order columns must degrade to `created_at` ordering; under no
//! input may the query fail or the schema change.

use maestro_db::queries::tasks::{self, NewTask};
use maestro_test_utils::TestDb;

fn new_task(id: &str) -> NewTask {
    NewTask {
        id: id.to_string(),
        title: format!("Task {id}"),
        ..Default::default()
    }
}

#[tokio::test]
async fn malicious_order_by_falls_back_and_drops_nothing() {
    let db = TestDb::create().await;

    tasks::insert_task(&db.pool, &new_task("T1")).await.unwrap();
    tasks::insert_task(&db.pool, &new_task("T2")).await.unwrap();

    // The canonical hostile input.
    let listed = tasks::list_tasks(&db.pool, 100, 0, "id; DROP TABLE tasks", false)
        .await
        .expect("query must execute with fallback ordering");
    assert_eq!(listed.len(), 2);
    // created_at ascending: insertion order.
    assert_eq!(listed[0].id, "T1");
    assert_eq!(listed[1].id, "T2");

    // The table must still exist and be queryable.
    let again = tasks::list_all_tasks(&db.pool).await.unwrap();
    assert_eq!(again.len(), 2);

    db.close().await;
}

#[tokio::test]
async fn keyword_and_unknown_columns_fall_back() {
    let db = TestDb::create().await;

    tasks::insert_task(&db.pool, &new_task("T1")).await.unwrap();
    tasks::insert_task(&db.pool, &new_task("T2")).await.unwrap();

    for hostile in ["DROP", "no_such_column", "created_at DESC", "a b"] {
        let listed = tasks::list_tasks(&db.pool, 100, 0, hostile, false)
            .await
            .unwrap_or_else(|e| panic!("order_by {hostile:?} must not fail: {e}"));
        assert_eq!(listed[0].id, "T1", "fallback ordering for {hostile:?}");
    }

    db.close().await;
}

#[tokio::test]
async fn valid_order_column_is_honored() {
    let db = TestDb::create().await;

    tasks::insert_task(&db.pool, &new_task("TB")).await.unwrap();
    tasks::insert_task(&db.pool, &new_task("TA")).await.unwrap();

    let by_id = tasks::list_tasks(&db.pool, 100, 0, "id", false).await.unwrap();
    assert_eq!(by_id[0].id, "TA");
    assert_eq!(by_id[1].id, "TB");

    db.close().await;
}
