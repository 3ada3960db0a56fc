mod common;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::seed_task;
use common::test_env;
use steroids_core::selector::SelectorConfig;
use steroids_core::selector::TaskSelector;
use steroids_state::AuditParams;
use steroids_state::SectionCreateParams;
use steroids_state::TaskCreateParams;
use steroids_state::TaskStatus;

fn selector_config(scope: Vec<String>) -> SelectorConfig {
    SelectorConfig {
        lease_ttl: Duration::from_secs(600),
        heartbeat_interval: Duration::from_secs(30),
        section_scope: scope,
    }
}

#[tokio::test]
async fn review_work_is_selected_before_pending_work() {
    let env = test_env().await;
    seed_task(&env.store, "pending-task").await;
    seed_task(&env.store, "review-task").await;
    let audit = AuditParams::runner("seed");
    env.store
        .transition_task_if(
            "review-task",
            TaskStatus::Pending,
            TaskStatus::InProgress,
            &audit,
        )
        .await
        .expect("start");
    env.store
        .transition_task_if(
            "review-task",
            TaskStatus::InProgress,
            TaskStatus::Review,
            &audit,
        )
        .await
        .expect("to review");

    let selector = TaskSelector::new(env.store.clone(), "r1".to_string());
    let selected = selector
        .select_next(&selector_config(Vec::new()))
        .await
        .expect("select")
        .expect("task available");
    assert_eq!(selected.task.id, "review-task");

    // The lease is held by the time the task is returned.
    let lock = env
        .store
        .get_task_lock("review-task")
        .await
        .expect("get lock")
        .expect("lock exists");
    assert_eq!(lock.runner_id, "r1");
    let _ = selected.guard.release().await;
}

#[tokio::test]
async fn foreign_leases_push_selection_to_the_next_candidate() {
    let env = test_env().await;
    seed_task(&env.store, "first").await;
    seed_task(&env.store, "second").await;
    env.store
        .acquire_task_lock("first", "other-runner", Duration::from_secs(600))
        .await
        .expect("foreign lock");

    let selector = TaskSelector::new(env.store.clone(), "r1".to_string());
    let selected = selector
        .select_next(&selector_config(Vec::new()))
        .await
        .expect("select")
        .expect("task available");
    assert_eq!(selected.task.id, "second");
    let _ = selected.guard.release().await;
}

#[tokio::test]
async fn batch_mode_leases_same_section_pending_tasks_atomically() {
    let env = test_env().await;
    env.store
        .create_section(&SectionCreateParams {
            id: "s1".to_string(),
            name: "first".to_string(),
            position: 1,
            priority: 50,
        })
        .await
        .expect("section");
    for id in ["a", "b", "c"] {
        env.store
            .create_task(&TaskCreateParams {
                id: id.to_string(),
                title: id.to_string(),
                section_id: Some("s1".to_string()),
                ..Default::default()
            })
            .await
            .expect("task");
    }
    seed_task(&env.store, "other-section").await;

    let selector = TaskSelector::new(env.store.clone(), "r1".to_string());
    let batch = selector
        .select_batch(&selector_config(Vec::new()), 2)
        .await
        .expect("batch");
    let ids: Vec<&str> = batch.iter().map(|member| member.task.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(env.store.list_task_locks().await.expect("locks").len(), 2);
    for member in batch {
        let _ = member.guard.release().await;
    }
}

#[tokio::test]
async fn waiting_selection_picks_up_a_released_lease() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    env.store
        .acquire_task_lock("t1", "other-runner", Duration::from_secs(600))
        .await
        .expect("foreign lock");

    let releaser = env.store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = releaser.release_task_lock("t1", "other-runner").await;
    });

    let selector = TaskSelector::new(env.store.clone(), "r1".to_string());
    let selected = selector
        .select_waiting(
            &selector_config(Vec::new()),
            Duration::from_millis(50),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .expect("wait")
        .expect("task becomes available");
    assert_eq!(selected.task.id, "t1");
    let _ = selected.guard.release().await;
}

#[tokio::test]
async fn waiting_selection_returns_none_when_all_work_is_done() {
    let env = test_env().await;
    let selector = TaskSelector::new(env.store.clone(), "r1".to_string());
    let selected = selector
        .select_waiting(
            &selector_config(Vec::new()),
            Duration::from_millis(50),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .expect("wait");
    assert!(selected.is_none());
}

#[tokio::test]
async fn waiting_selection_honors_cancellation() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    env.store
        .acquire_task_lock("t1", "other-runner", Duration::from_secs(600))
        .await
        .expect("foreign lock");

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        canceller.cancel();
    });

    let selector = TaskSelector::new(env.store.clone(), "r1".to_string());
    let started = std::time::Instant::now();
    let selected = selector
        .select_waiting(
            &selector_config(Vec::new()),
            Duration::from_millis(50),
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .expect("wait");
    assert!(selected.is_none());
    assert!(started.elapsed() < Duration::from_secs(5));
}
