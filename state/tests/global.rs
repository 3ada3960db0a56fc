use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use steroids_state::GlobalStore;
use steroids_state::OpenOptions;
use steroids_state::RunnerRegistration;
use steroids_state::RunnerStatus;
use steroids_state::SteroidsHome;
use steroids_state::WorkstreamStatus;
use uuid::Uuid;

fn unique_home() -> SteroidsHome {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    SteroidsHome::at(
        std::env::temp_dir().join(format!("steroids-global-test-{nanos}-{}", Uuid::new_v4())),
    )
}

fn registration(id: &str, project: &str) -> RunnerRegistration {
    RunnerRegistration {
        id: id.to_string(),
        pid: 4242,
        project_path: project.to_string(),
        section_id: None,
        parallel_session_id: None,
    }
}

#[tokio::test]
async fn runner_registry_round_trip() {
    let store = GlobalStore::open(unique_home(), &OpenOptions::default())
        .await
        .expect("open");

    let runner = store
        .register_runner(&registration("r1", "/proj"))
        .await
        .expect("register");
    assert_eq!(runner.status, RunnerStatus::Running);
    assert_eq!(runner.pid, 4242);

    assert!(store.heartbeat_runner("r1").await.expect("heartbeat"));
    assert!(
        store
            .set_runner_task("r1", Some("t1"), Some("s1"))
            .await
            .expect("assign")
    );
    let runner = store
        .get_runner("r1")
        .await
        .expect("get")
        .expect("runner exists");
    assert_eq!(runner.current_task_id.as_deref(), Some("t1"));

    let for_project = store
        .list_runners_for_project("/proj")
        .await
        .expect("list");
    assert_eq!(for_project.len(), 1);
    assert!(
        store
            .list_runners_for_project("/other")
            .await
            .expect("list")
            .is_empty()
    );

    assert!(store.delete_runner("r1").await.expect("delete"));
    assert!(store.get_runner("r1").await.expect("get").is_none());
}

#[tokio::test]
async fn re_registration_refreshes_an_existing_row() {
    let store = GlobalStore::open(unique_home(), &OpenOptions::default())
        .await
        .expect("open");
    store
        .register_runner(&registration("r1", "/proj"))
        .await
        .expect("register");

    let mut second = registration("r1", "/proj2");
    second.pid = 999;
    let runner = store.register_runner(&second).await.expect("re-register");
    assert_eq!(runner.pid, 999);
    assert_eq!(runner.project_path, "/proj2");
    assert_eq!(store.list_runners().await.expect("list").len(), 1);
}

#[tokio::test]
async fn workstream_lease_is_claim_once_until_expired() {
    let store = GlobalStore::open(unique_home(), &OpenOptions::default())
        .await
        .expect("open");
    store
        .create_parallel_session("sess", "/proj")
        .await
        .expect("session");
    store
        .create_workstream("ws1", "sess", "steroids/ws1", &["s1".to_string()], None)
        .await
        .expect("workstream");

    assert!(
        store
            .claim_workstream("ws1", "r1", Duration::from_secs(600))
            .await
            .expect("claim")
    );
    assert!(
        !store
            .claim_workstream("ws1", "r2", Duration::from_secs(600))
            .await
            .expect("claim")
    );
    // The holder may renew its own lease.
    assert!(
        store
            .claim_workstream("ws1", "r1", Duration::from_secs(600))
            .await
            .expect("renew")
    );

    // An expired lease is claimable by anyone.
    sqlx::query("UPDATE workstreams SET lease_expires_at = 1 WHERE id = 'ws1'")
        .execute(store.pool())
        .await
        .expect("expire");
    assert!(
        store
            .claim_workstream("ws1", "r2", Duration::from_secs(600))
            .await
            .expect("steal")
    );

    assert!(
        store
            .set_workstream_status("ws1", WorkstreamStatus::Completed)
            .await
            .expect("complete")
    );
    let workstream = store
        .get_workstream("ws1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(workstream.status, WorkstreamStatus::Completed);
    assert!(workstream.completed_at.is_some());
    assert_eq!(workstream.section_ids, vec!["s1".to_string()]);
}

#[tokio::test]
async fn activity_log_appends() {
    let store = GlobalStore::open(unique_home(), &OpenOptions::default())
        .await
        .expect("open");
    store
        .append_activity(
            "/proj",
            Some("r1"),
            Some("t1"),
            Some("title"),
            None,
            Some("completed"),
            None,
            None,
        )
        .await
        .expect("append");
}
