mod common;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::seed_task;
use common::test_env;
use common::write_script;
use steroids_core::SteroidsErr;
use steroids_core::exec::InvocationRequest;
use steroids_core::exec::InvocationSupervisor;
use steroids_core::providers::FailureKind;
use steroids_core::providers::ProviderKind;
use steroids_state::InvocationRole;
use steroids_state::InvocationStatus;

fn request(script_template: String, task_id: &str, cwd: std::path::PathBuf) -> InvocationRequest {
    InvocationRequest {
        task_id: task_id.to_string(),
        role: InvocationRole::Coder,
        provider: ProviderKind::Claude,
        model: "test-model".to_string(),
        prompt: "do the thing".to_string(),
        cwd,
        idle_timeout: Duration::from_secs(10),
        custom_template: Some(script_template),
        stream_to_parent_stdio: false,
        rejection_number: None,
    }
}

#[tokio::test]
async fn captures_output_and_closes_the_invocation_row() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    let script = write_script(env.project_root(), "ok.sh", "echo \"hello from provider\"").await;

    let supervisor = InvocationSupervisor::new(env.store.clone());
    let outcome = supervisor
        .invoke(
            &request(
                format!("{} {{prompt}}", script.display()),
                "t1",
                env.project_root().to_path_buf(),
            ),
            &CancellationToken::new(),
            None,
        )
        .await
        .expect("invoke");

    assert!(outcome.success);
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.stdout.contains("hello from provider"));
    assert!(!outcome.timed_out);

    let row = env
        .store
        .get_invocation(outcome.invocation_id)
        .await
        .expect("get invocation")
        .expect("row exists");
    assert_eq!(row.status, InvocationStatus::Completed);
    assert!(row.success);
    assert!(row.completed_at_ms.is_some());
    assert!(row.response.unwrap_or_default().contains("hello from provider"));

    // The JSONL transcript exists alongside the row.
    let transcript = env.store.paths().invocation_log_path(outcome.invocation_id);
    let text = tokio::fs::read_to_string(&transcript).await.expect("transcript");
    assert!(text.contains("hello from provider"));
}

#[tokio::test]
async fn silent_child_is_killed_by_the_activity_watchdog() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    let script = write_script(env.project_root(), "hang.sh", "sleep 30").await;

    let supervisor =
        InvocationSupervisor::with_kill_grace(env.store.clone(), Duration::from_millis(300));
    let mut request = request(
        format!("{} {{prompt}}", script.display()),
        "t1",
        env.project_root().to_path_buf(),
    );
    request.idle_timeout = Duration::from_millis(300);

    let started = std::time::Instant::now();
    let outcome = supervisor
        .invoke(&request, &CancellationToken::new(), None)
        .await
        .expect("invoke");

    assert!(outcome.timed_out);
    assert!(!outcome.success);
    assert!(started.elapsed() < Duration::from_secs(10));

    let row = env
        .store
        .get_invocation(outcome.invocation_id)
        .await
        .expect("get invocation")
        .expect("row exists");
    assert_eq!(row.status, InvocationStatus::Timeout);
    assert!(row.timed_out);
}

#[tokio::test]
async fn stderr_drives_failure_classification() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    let script = write_script(
        env.project_root(),
        "credit.sh",
        "echo \"Your credit balance is too low\" 1>&2; exit 1",
    )
    .await;

    let supervisor = InvocationSupervisor::new(env.store.clone());
    let outcome = supervisor
        .invoke(
            &request(
                format!("{} {{prompt}}", script.display()),
                "t1",
                env.project_root().to_path_buf(),
            ),
            &CancellationToken::new(),
            None,
        )
        .await
        .expect("invoke");

    assert!(!outcome.success);
    assert_eq!(outcome.classification.kind, FailureKind::CreditExhaustion);

    let row = env
        .store
        .get_invocation(outcome.invocation_id)
        .await
        .expect("get invocation")
        .expect("row exists");
    assert_eq!(row.status, InvocationStatus::Failed);
}

#[tokio::test]
async fn cancellation_terminates_the_child_and_closes_the_row() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    let script = write_script(env.project_root(), "slow.sh", "sleep 30").await;

    let supervisor =
        InvocationSupervisor::with_kill_grace(env.store.clone(), Duration::from_millis(300));
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let err = supervisor
        .invoke(
            &request(
                format!("{} {{prompt}}", script.display()),
                "t1",
                env.project_root().to_path_buf(),
            ),
            &cancel,
            None,
        )
        .await
        .expect_err("must be cancelled");
    assert!(matches!(err, SteroidsErr::CancellationRequested));

    // The final invocation row was written before returning.
    let invocations = env
        .store
        .list_invocations_for_task("t1", None)
        .await
        .expect("list");
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].status, InvocationStatus::Failed);
}

#[tokio::test]
async fn activity_callback_fires_per_chunk() {
    let env = test_env().await;
    seed_task(&env.store, "t1").await;
    let script = write_script(env.project_root(), "chatty.sh", "echo one; echo two").await;

    let supervisor = InvocationSupervisor::new(env.store.clone());
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let seen = counter.clone();
    let outcome = supervisor
        .invoke(
            &request(
                format!("{} {{prompt}}", script.display()),
                "t1",
                env.project_root().to_path_buf(),
            ),
            &CancellationToken::new(),
            Some(std::sync::Arc::new(move || {
                seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            })),
        )
        .await
        .expect("invoke");

    assert!(outcome.success);
    assert!(counter.load(std::sync::atomic::Ordering::Relaxed) >= 1);
}
