mod common;

use std::time::Duration;

use common::scripted_slot;
use common::seed_task;
use common::test_env;
use common::write_script;
use steroids_core::config::Config;
use steroids_core::orchestrator::LoopOutcome;
use steroids_core::orchestrator::Orchestrator;
use steroids_core::orchestrator::OrchestratorOptions;
use steroids_state::ActorType;
use steroids_state::FailureMode;
use steroids_state::InvocationRole;
use steroids_state::Resolution;
use steroids_state::TaskStatus;

fn options(runner_id: &str, once: bool) -> OrchestratorOptions {
    OrchestratorOptions {
        runner_id: runner_id.to_string(),
        once,
        credit_poll_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

#[tokio::test]
async fn happy_path_drives_a_task_to_completed() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    let coder = write_script(env.project_root(), "coder.sh", "echo \"TASK COMPLETE\"").await;
    let reviewer =
        write_script(env.project_root(), "reviewer.sh", "echo \"DECISION: APPROVE\"").await;

    let mut config = Config::default();
    config.ai.coder = scripted_slot(&coder);
    config.ai.reviewer = scripted_slot(&reviewer);

    let orchestrator = Orchestrator::new(
        env.project_root().to_path_buf(),
        env.store.clone(),
        env.global.clone(),
        env.home.clone(),
        config,
        options("r1", false),
        None,
    );
    let summary = orchestrator.run().await.expect("run");
    assert_eq!(summary.outcome, LoopOutcome::Idle);

    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Completed);

    // Three transitions, in order, each with its audit row.
    let audit = env.store.list_audit("t1").await.expect("audit");
    let transitions: Vec<(TaskStatus, TaskStatus)> = audit
        .iter()
        .map(|entry| (entry.from_status, entry.to_status))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (TaskStatus::Pending, TaskStatus::InProgress),
            (TaskStatus::InProgress, TaskStatus::Review),
            (TaskStatus::Review, TaskStatus::Completed),
        ]
    );
    assert!(audit.iter().all(|entry| entry.actor_type == ActorType::Runner));

    // One invocation per role, no leftover locks, no incidents, no runner.
    let invocations = env
        .store
        .list_invocations_for_task("t1", None)
        .await
        .expect("invocations");
    let roles: Vec<InvocationRole> = invocations.iter().map(|i| i.role).collect();
    assert_eq!(roles, vec![InvocationRole::Coder, InvocationRole::Reviewer]);
    assert!(invocations.iter().all(|i| i.success));
    assert!(env.store.list_task_locks().await.expect("locks").is_empty());
    assert_eq!(env.store.incidents_in_last_hour().await.expect("count"), 0);
    assert!(env.global.list_runners().await.expect("runners").is_empty());
}

#[tokio::test]
async fn rejection_returns_the_task_to_the_coder() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    let coder = write_script(env.project_root(), "coder.sh", "echo \"TASK COMPLETE\"").await;
    let reviewer =
        write_script(env.project_root(), "reviewer.sh", "echo \"DECISION: REJECT\"").await;

    let mut config = Config::default();
    config.ai.coder = scripted_slot(&coder);
    config.ai.reviewer = scripted_slot(&reviewer);

    // First single-shot pass: pending → in_progress → coder → review.
    let orchestrator = Orchestrator::new(
        env.project_root().to_path_buf(),
        env.store.clone(),
        env.global.clone(),
        env.home.clone(),
        config.clone(),
        options("r1", true),
        None,
    );
    orchestrator.run().await.expect("first pass");
    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Review);

    // Second single-shot pass: reviewer rejects, task returns to the coder
    // with the rejection counted.
    let orchestrator = Orchestrator::new(
        env.project_root().to_path_buf(),
        env.store.clone(),
        env.global.clone(),
        env.home.clone(),
        config,
        options("r1", true),
        None,
    );
    orchestrator.run().await.expect("second pass");

    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.rejection_count, 1);
}

#[tokio::test]
async fn credit_exhaustion_pauses_until_the_config_changes() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    let coder = write_script(
        env.project_root(),
        "credit.sh",
        "echo \"insufficient credits\" 1>&2; exit 1",
    )
    .await;

    // The pause loop reloads configuration from disk, so the initial state
    // must live there too.
    let config_path = steroids_core::config::project_config_path(env.project_root());
    steroids_core::config::set_config_file_value(
        &config_path,
        "ai.coder.provider",
        serde_yaml::Value::String("claude".to_string()),
    )
    .await
    .expect("seed provider");
    steroids_core::config::set_config_file_value(
        &config_path,
        "ai.coder.model",
        serde_yaml::Value::String("m1".to_string()),
    )
    .await
    .expect("seed model");
    steroids_core::config::set_config_file_value(
        &config_path,
        "ai.coder.cli",
        serde_yaml::Value::String(format!("{} {{prompt}}", coder.display())),
    )
    .await
    .expect("seed cli");

    let config = steroids_core::config::load_config(env.project_root(), &env.home)
        .await
        .expect("load");
    assert_eq!(config.ai.coder.model, "m1");

    let orchestrator = Orchestrator::new(
        env.project_root().to_path_buf(),
        env.store.clone(),
        env.global.clone(),
        env.home.clone(),
        config,
        options("r1", false),
        None,
    );
    let cancel = orchestrator.cancellation_token();
    let handle = tokio::spawn(async move { orchestrator.run().await });

    // Wait for the open, deduped credit incident.
    let incident = wait_for(|| async {
        env.store
            .open_credit_incident("claude", "m1", InvocationRole::Coder)
            .await
            .expect("query incident")
    })
    .await
    .expect("credit incident recorded");
    assert_eq!(incident.failure_mode, FailureMode::CreditExhaustion);

    // No transition happened: the task is parked in_progress.
    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::InProgress);

    // Operator swaps the model; the next poll resolves the incident.
    steroids_core::config::set_config_file_value(
        &config_path,
        "ai.coder.model",
        serde_yaml::Value::String("m2".to_string()),
    )
    .await
    .expect("swap model");

    let incident_id = incident.id.clone();
    let resolved = wait_for(|| async {
        let incident = env
            .store
            .get_incident(&incident_id)
            .await
            .expect("get incident")
            .expect("incident exists");
        (incident.resolution == Some(Resolution::ConfigChanged)).then_some(incident)
    })
    .await
    .expect("incident resolved as config_changed");
    assert!(resolved.resolved_at.is_some());

    cancel.cancel();
    let summary = handle.await.expect("join").expect("run");
    assert_eq!(summary.outcome, LoopOutcome::Cancelled);
}

#[tokio::test]
async fn batch_mode_implements_the_whole_batch_with_one_coder_invocation() {
    let env = test_env().await;
    env.store
        .create_section(&steroids_state::SectionCreateParams {
            id: "s1".to_string(),
            name: "first".to_string(),
            position: 1,
            priority: 50,
        })
        .await
        .expect("section");
    for id in ["a", "b", "c"] {
        env.store
            .create_task(&steroids_state::TaskCreateParams {
                id: id.to_string(),
                title: id.to_string(),
                section_id: Some("s1".to_string()),
                ..Default::default()
            })
            .await
            .expect("task");
    }

    let coder = write_script(env.project_root(), "coder.sh", "echo \"TASK COMPLETE\"").await;
    let reviewer =
        write_script(env.project_root(), "reviewer.sh", "echo \"DECISION: APPROVE\"").await;
    let mut config = Config::default();
    config.ai.coder = scripted_slot(&coder);
    config.ai.reviewer = scripted_slot(&reviewer);
    config.sections.batch_mode = true;
    config.sections.max_batch_size = 3;

    let orchestrator = Orchestrator::new(
        env.project_root().to_path_buf(),
        env.store.clone(),
        env.global.clone(),
        env.home.clone(),
        config,
        options("r1", false),
        None,
    );
    let summary = orchestrator.run().await.expect("run");
    assert_eq!(summary.outcome, LoopOutcome::Idle);

    let mut coder_invocations = 0;
    let mut reviewer_invocations = 0;
    for id in ["a", "b", "c"] {
        let task = env.store.get_task(id).await.expect("get").expect("exists");
        assert_eq!(task.status, TaskStatus::Completed);
        coder_invocations += env
            .store
            .list_invocations_for_task(id, Some(InvocationRole::Coder))
            .await
            .expect("invocations")
            .len();
        reviewer_invocations += env
            .store
            .list_invocations_for_task(id, Some(InvocationRole::Reviewer))
            .await
            .expect("invocations")
            .len();
    }
    // One invocation implemented the whole batch; review is still per task.
    assert_eq!(coder_invocations, 1);
    assert_eq!(reviewer_invocations, 3);
    assert!(env.store.list_task_locks().await.expect("locks").is_empty());
}

#[tokio::test]
async fn transient_store_errors_do_not_kill_the_loop() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    let coder = write_script(env.project_root(), "coder.sh", "echo \"TASK COMPLETE\"").await;
    let mut config = Config::default();
    config.ai.coder = scripted_slot(&coder);
    config.locking.poll_interval =
        steroids_core::config::DurationValue(Duration::from_millis(50));

    // Break the audit table so every status transition errors out.
    sqlx::query("ALTER TABLE audit RENAME TO audit_broken")
        .execute(env.store.pool())
        .await
        .expect("break audit table");

    let orchestrator = Orchestrator::new(
        env.project_root().to_path_buf(),
        env.store.clone(),
        env.global.clone(),
        env.home.clone(),
        config,
        options("r1", false),
        None,
    );
    let cancel = orchestrator.cancellation_token();
    let handle = tokio::spawn(async move { orchestrator.run().await });

    // The loop keeps polling through repeated task-pass failures instead of
    // propagating them out of run().
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!handle.is_finished());

    cancel.cancel();
    let summary = handle.await.expect("join").expect("run survives");
    assert_eq!(summary.outcome, LoopOutcome::Cancelled);
}

#[tokio::test]
async fn rejection_cap_auto_disputes_instead_of_invoking_the_coder() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    env.store
        .transition_task_if(
            "t1",
            TaskStatus::Pending,
            TaskStatus::InProgress,
            &steroids_state::AuditParams::runner("seed"),
        )
        .await
        .expect("start");
    sqlx::query("UPDATE tasks SET rejection_count = 15 WHERE id = 't1'")
        .execute(env.store.pool())
        .await
        .expect("preload rejections");

    // The coder script would crash loudly if it ever ran.
    let coder = write_script(env.project_root(), "coder.sh", "exit 97").await;
    let mut config = Config::default();
    config.ai.coder = scripted_slot(&coder);

    let orchestrator = Orchestrator::new(
        env.project_root().to_path_buf(),
        env.store.clone(),
        env.global.clone(),
        env.home.clone(),
        config,
        options("r1", true),
        None,
    );
    orchestrator.run().await.expect("run");

    let task = env.store.get_task("t1").await.expect("get").expect("exists");
    assert_eq!(task.status, TaskStatus::Disputed);
    let disputes = env.store.list_open_disputes().await.expect("disputes");
    assert_eq!(disputes.len(), 1);
    assert_eq!(disputes[0].task_id, "t1");
    // No coder invocation was attempted.
    assert!(
        env.store
            .list_invocations_for_task("t1", None)
            .await
            .expect("invocations")
            .is_empty()
    );
}

#[tokio::test]
async fn empty_catalog_exits_idle_and_deregisters() {
    let env = test_env().await;
    let orchestrator = Orchestrator::new(
        env.project_root().to_path_buf(),
        env.store.clone(),
        env.global.clone(),
        env.home.clone(),
        Config::default(),
        options("r1", false),
        None,
    );
    let summary = orchestrator.run().await.expect("run");
    assert_eq!(summary.outcome, LoopOutcome::Idle);
    assert_eq!(summary.tasks_processed, 0);
    assert!(env.global.list_runners().await.expect("runners").is_empty());
}

async fn wait_for<T, F, Fut>(mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..100 {
        if let Some(value) = probe().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}
