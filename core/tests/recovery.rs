mod common;

use std::sync::Arc;
use std::time::Duration;

use common::seed_task;
use common::test_env;
use steroids_core::config::HealthConfig;
use steroids_core::recovery::ProcessProbe;
use steroids_core::recovery::RecoveryEngine;
use steroids_core::recovery::Sanitizer;
use steroids_state::AuditParams;
use steroids_state::FailureMode;
use steroids_state::IncidentCreateParams;
use steroids_state::InvocationCreateParams;
use steroids_state::InvocationRole;
use steroids_state::InvocationStatus;
use steroids_state::ProjectStore;
use steroids_state::Resolution;
use steroids_state::RunnerRegistration;
use steroids_state::TaskStatus;

struct FixedProbe {
    alive: Vec<i64>,
}

impl ProcessProbe for FixedProbe {
    fn is_alive(&self, pid: i64) -> bool {
        self.alive.contains(&pid)
    }
}

async fn backdate_task(store: &ProjectStore, task_id: &str, seconds: i64) {
    let then = chrono::Utc::now().timestamp() - seconds;
    sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
        .bind(then)
        .bind(task_id)
        .execute(store.pool())
        .await
        .expect("backdate task");
}

async fn backdate_lock(store: &ProjectStore, task_id: &str, seconds: i64) {
    let then = chrono::Utc::now().timestamp() - seconds;
    sqlx::query("UPDATE task_locks SET expires_at = ? WHERE task_id = ?")
        .bind(then)
        .bind(task_id)
        .execute(store.pool())
        .await
        .expect("backdate lock");
}

async fn start_task(store: &ProjectStore, task_id: &str) {
    store
        .transition_task_if(
            task_id,
            TaskStatus::Pending,
            TaskStatus::InProgress,
            &AuditParams::runner("r1"),
        )
        .await
        .expect("start task");
}

#[tokio::test]
async fn orphaned_task_is_restarted_with_one_failure_charged() {
    // A crashed runner left the task in_progress with an expired lease and
    // no registration row behind.
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    start_task(&env.store, "t1").await;
    env.store
        .acquire_task_lock("t1", "r1", Duration::from_secs(600))
        .await
        .expect("acquire");
    backdate_lock(&env.store, "t1", 10).await;
    backdate_task(&env.store, "t1", 700).await;

    let engine = RecoveryEngine::new(
        env.store.clone(),
        env.global.clone(),
        HealthConfig::default(),
        Arc::new(FixedProbe { alive: vec![] }),
        env.project_path(),
    );

    let report = engine.run(true).await.expect("recover");
    assert_eq!(report.actions.len(), 1);
    assert_eq!(report.actions[0].failure_mode, FailureMode::OrphanedTask);
    assert_eq!(report.actions[0].resolution, Resolution::AutoRestart);
    assert!(!report.rate_limited);

    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.failure_count, 1);
    assert!(env.store.list_task_locks().await.expect("locks").is_empty());
    assert_eq!(env.store.incidents_in_last_hour().await.expect("count"), 1);

    // Idempotency: a second run against the recovered state does nothing.
    let second = engine.run(true).await.expect("recover again");
    assert!(second.detections.is_empty());
    assert!(second.actions.is_empty());
    assert_eq!(env.store.incidents_in_last_hour().await.expect("count"), 1);
}

#[tokio::test]
async fn exhausted_failure_budget_parks_the_task_as_skipped() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    start_task(&env.store, "t1").await;
    backdate_task(&env.store, "t1", 700).await;
    sqlx::query("UPDATE tasks SET failure_count = 2 WHERE id = 't1'")
        .execute(env.store.pool())
        .await
        .expect("preload failures");

    let engine = RecoveryEngine::new(
        env.store.clone(),
        env.global.clone(),
        HealthConfig::default(),
        Arc::new(FixedProbe { alive: vec![] }),
        env.project_path(),
    );
    let report = engine.run(true).await.expect("recover");
    assert_eq!(report.actions.len(), 1);
    assert_eq!(report.actions[0].resolution, Resolution::Skipped);

    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Skipped);
    assert_eq!(task.failure_count, 3);
}

#[tokio::test]
async fn incident_ceiling_suppresses_all_actions() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    start_task(&env.store, "t1").await;
    backdate_task(&env.store, "t1", 700).await;

    for _ in 0..10 {
        env.store
            .record_incident(&IncidentCreateParams {
                task_id: None,
                runner_id: None,
                failure_mode: FailureMode::OrphanedTask,
                resolution: Some(Resolution::AutoRestart),
                details: None,
            })
            .await
            .expect("incident");
    }

    let engine = RecoveryEngine::new(
        env.store.clone(),
        env.global.clone(),
        HealthConfig::default(),
        Arc::new(FixedProbe { alive: vec![] }),
        env.project_path(),
    );
    let report = engine.run(true).await.expect("recover");

    // Detection still reports; recovery does nothing.
    assert_eq!(report.detections.len(), 1);
    assert!(report.rate_limited);
    assert!(report.actions.is_empty());
    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::InProgress);
}

#[tokio::test]
async fn dead_runner_is_cleaned_up_and_its_task_restarted() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    start_task(&env.store, "t1").await;
    env.store
        .acquire_task_lock("t1", "r-dead", Duration::from_secs(600))
        .await
        .expect("acquire");

    env.global
        .register_runner(&RunnerRegistration {
            id: "r-dead".to_string(),
            pid: 999_999_999,
            project_path: env.project_path(),
            section_id: None,
            parallel_session_id: None,
        })
        .await
        .expect("register");
    env.global
        .set_runner_task("r-dead", Some("t1"), None)
        .await
        .expect("assign");

    let engine = RecoveryEngine::new(
        env.store.clone(),
        env.global.clone(),
        HealthConfig::default(),
        Arc::new(FixedProbe { alive: vec![] }),
        env.project_path(),
    )
    .with_kill_grace(Duration::from_millis(10));

    let report = engine.run(true).await.expect("recover");
    assert_eq!(report.actions.len(), 1);
    assert_eq!(report.actions[0].failure_mode, FailureMode::DeadRunner);
    assert_eq!(report.actions[0].resolution, Resolution::KilledRunner);

    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.failure_count, 1);
    assert!(env.store.list_task_locks().await.expect("locks").is_empty());
    assert!(
        env.global
            .get_runner("r-dead")
            .await
            .expect("get runner")
            .is_none()
    );
}

#[tokio::test]
async fn hanging_reviewer_with_fresh_runner_is_recovered() {
    // Scenario: review task, running reviewer invocation idle past the
    // staleness limit, runner heartbeat fresh.
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    start_task(&env.store, "t1").await;
    env.store
        .transition_task_if(
            "t1",
            TaskStatus::InProgress,
            TaskStatus::Review,
            &AuditParams::runner("r1"),
        )
        .await
        .expect("to review");
    env.store
        .acquire_task_lock("t1", "r-hang", Duration::from_secs(3600))
        .await
        .expect("acquire");

    let now_ms = chrono::Utc::now().timestamp_millis();
    let invocation_id = env
        .store
        .open_invocation(&InvocationCreateParams {
            task_id: "t1".to_string(),
            role: InvocationRole::Reviewer,
            provider: "claude".to_string(),
            model: "m".to_string(),
            prompt: "review".to_string(),
            started_at_ms: now_ms - 800_000,
            rejection_number: None,
        })
        .await
        .expect("open invocation");
    env.store
        .record_invocation_activity(invocation_id, now_ms - 700_000)
        .await
        .expect("stamp activity");

    env.global
        .register_runner(&RunnerRegistration {
            id: "r-hang".to_string(),
            pid: 999_999_998,
            project_path: env.project_path(),
            section_id: None,
            parallel_session_id: None,
        })
        .await
        .expect("register");
    env.global
        .set_runner_task("r-hang", Some("t1"), None)
        .await
        .expect("assign");

    let engine = RecoveryEngine::new(
        env.store.clone(),
        env.global.clone(),
        HealthConfig::default(),
        Arc::new(FixedProbe {
            alive: vec![999_999_998],
        }),
        env.project_path(),
    )
    .with_kill_grace(Duration::from_millis(10));

    let report = engine.run(true).await.expect("recover");
    assert_eq!(report.detections.len(), 1);
    assert_eq!(
        report.detections[0].failure_mode,
        FailureMode::HangingInvocation
    );
    assert_eq!(report.detections[0].phase, Some(InvocationRole::Reviewer));
    assert_eq!(report.actions.len(), 1);

    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.failure_count, 1);
    assert!(
        env.global
            .get_runner("r-hang")
            .await
            .expect("get runner")
            .is_none()
    );
    let invocation = env
        .store
        .get_invocation(invocation_id)
        .await
        .expect("get invocation")
        .expect("row exists");
    assert_eq!(invocation.status, InvocationStatus::Timeout);
    assert_eq!(env.store.incidents_in_last_hour().await.expect("count"), 1);
}

#[tokio::test]
async fn sanitizer_honors_a_buried_approval_exactly_once() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    start_task(&env.store, "t1").await;
    env.store
        .transition_task_if(
            "t1",
            TaskStatus::InProgress,
            TaskStatus::Review,
            &AuditParams::runner("r1"),
        )
        .await
        .expect("to review");

    let now_ms = chrono::Utc::now().timestamp_millis();
    let invocation_id = env
        .store
        .open_invocation(&InvocationCreateParams {
            task_id: "t1".to_string(),
            role: InvocationRole::Reviewer,
            provider: "claude".to_string(),
            model: "m".to_string(),
            prompt: "review".to_string(),
            started_at_ms: now_ms - 2_000_000,
            rejection_number: None,
        })
        .await
        .expect("open invocation");

    let transcript = env.store.paths().invocation_log_path(invocation_id);
    tokio::fs::create_dir_all(transcript.parent().expect("parent"))
        .await
        .expect("mkdir");
    tokio::fs::write(
        &transcript,
        "{\"event\":\"stdout\",\"data\":\"DECISION: APPROVE\"}\n",
    )
    .await
    .expect("write transcript");

    let sanitizer = Sanitizer::new(env.store.clone(), HealthConfig::default());
    let report = sanitizer.run(true).await.expect("sanitize");
    assert_eq!(report.approved_reviews, 1);
    assert_eq!(report.closed_invocations, 1);

    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Completed);

    // A second pass is a no-op: the invocation is closed and the task
    // transitioned exactly once.
    let second = sanitizer.run(true).await.expect("sanitize again");
    assert_eq!(second.closed_invocations, 0);
    let audit = env.store.list_audit("t1").await.expect("audit");
    let completions = audit
        .iter()
        .filter(|entry| entry.to_status == TaskStatus::Completed)
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn sanitizer_sweeps_expired_leases() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    env.store
        .acquire_task_lock("t1", "r1", Duration::from_secs(600))
        .await
        .expect("acquire");
    backdate_lock(&env.store, "t1", 10).await;

    let sanitizer = Sanitizer::new(env.store.clone(), HealthConfig::default());
    let report = sanitizer.run(true).await.expect("sanitize");
    assert_eq!(report.expired_task_locks, 1);
    assert!(env.store.list_task_locks().await.expect("locks").is_empty());
}
