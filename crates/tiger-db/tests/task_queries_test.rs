//! Integration tests for task and queue queries.

use tiger_db::models::TaskStatus;
use tiger_db::queries::{queue, tasks};
use tiger_test_utils::{create_test_db, drop_test_db};

fn new_task(title: &str) -> tasks::NewTask {
    tasks::NewTask {
        title: title.into(),
        goal: format!("goal for {title}"),
        allowed_paths: vec!["src/**".into()],
        commands: vec!["cargo test".into()],
        ..Default::default()
    }
}

#[tokio::test]
async fn insert_and_fetch_roundtrip() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, &new_task("roundtrip")).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 0);
    assert!(task.block_reason.is_none());

    let fetched = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.title, "roundtrip");
    assert_eq!(fetched.allowed_paths, vec!["src/**".to_owned()]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn optimistic_transition_requires_expected_status() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, &new_task("optimistic")).await.unwrap();

    // Wrong expected status: no rows.
    let rows = tasks::transition_task_status(
        &pool,
        task.id,
        TaskStatus::Running,
        TaskStatus::Done,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);

    // Correct expected status: one row.
    let rows = tasks::transition_task_status(
        &pool,
        task.id,
        TaskStatus::Queued,
        TaskStatus::Running,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn allowed_paths_update_persists() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, &new_task("widen")).await.unwrap();

    let widened = vec!["src/**".to_owned(), "docs/README.md".to_owned()];
    tasks::update_allowed_paths(&pool, task.id, &widened).await.unwrap();

    let fetched = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.allowed_paths, widened);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn notes_append_preserves_existing_content() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, &new_task("notes")).await.unwrap();

    tasks::append_task_note(&pool, task.id, "first line").await.unwrap();
    tasks::append_task_note(&pool, task.id, "second line").await.unwrap();

    let fetched = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.notes.as_deref(), Some("first line\nsecond line"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_count_increments() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(&pool, &new_task("retry")).await.unwrap();

    tasks::increment_retry_count(&pool, task.id).await.unwrap();
    tasks::increment_retry_count(&pool, task.id).await.unwrap();

    let fetched = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.retry_count, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_task_listing_excludes_self_and_terminal() {
    let (pool, db_name) = create_test_db().await;

    let me = tasks::insert_task(&pool, &new_task("me")).await.unwrap();
    let other = tasks::insert_task(&pool, &new_task("other")).await.unwrap();
    let done = tasks::insert_task(&pool, &new_task("done")).await.unwrap();
    tasks::transition_task_status(&pool, done.id, TaskStatus::Queued, TaskStatus::Running, None)
        .await
        .unwrap();
    tasks::transition_task_status(&pool, done.id, TaskStatus::Running, TaskStatus::Done, None)
        .await
        .unwrap();

    let concurrent = tasks::list_concurrent_tasks(&pool, me.id, 10).await.unwrap();
    let ids: Vec<_> = concurrent.iter().map(|t| t.id).collect();
    assert!(ids.contains(&other.id));
    assert!(!ids.contains(&me.id));
    assert!(!ids.contains(&done.id));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn queue_claim_is_exclusive_and_ordered() {
    let (pool, db_name) = create_test_db().await;

    let a = tasks::insert_task(&pool, &new_task("qa")).await.unwrap();
    let b = tasks::insert_task(&pool, &new_task("qb")).await.unwrap();
    queue::enqueue_job(&pool, "agent:one", a.id, "one").await.unwrap();
    queue::enqueue_job(&pool, "agent:one", b.id, "one").await.unwrap();

    let first = queue::claim_next_job(&pool, "agent:one").await.unwrap().unwrap();
    assert_eq!(first.task_id, a.id);

    let second = queue::claim_next_job(&pool, "agent:one").await.unwrap().unwrap();
    assert_eq!(second.task_id, b.id);

    // Queue drained.
    assert!(queue::claim_next_job(&pool, "agent:one").await.unwrap().is_none());

    // Released jobs become claimable again.
    queue::release_job(&pool, first.id).await.unwrap();
    let reclaimed = queue::claim_next_job(&pool, "agent:one").await.unwrap().unwrap();
    assert_eq!(reclaimed.task_id, a.id);

    queue::delete_job(&pool, reclaimed.id).await.unwrap();
    queue::delete_job(&pool, second.id).await.unwrap();

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn other_queues_are_invisible() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, &new_task("elsewhere")).await.unwrap();
    queue::enqueue_job(&pool, "agent:two", task.id, "two").await.unwrap();

    assert!(queue::claim_next_job(&pool, "agent:one").await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}
