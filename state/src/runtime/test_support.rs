use crate::OpenOptions;
use crate::ProjectStore;
use crate::model::TaskCreateParams;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

pub(super) fn unique_temp_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    std::env::temp_dir().join(format!("steroids-state-test-{nanos}-{}", Uuid::new_v4()))
}

pub(super) async fn open_test_store() -> ProjectStore {
    ProjectStore::open(&unique_temp_dir(), &OpenOptions::default())
        .await
        .expect("open test store")
}

pub(super) async fn seed_task(store: &ProjectStore, id: &str) -> crate::Task {
    store
        .create_task(&TaskCreateParams {
            id: id.to_string(),
            title: format!("task {id}"),
            ..Default::default()
        })
        .await
        .expect("create task")
}

/// Rewind a lease so it reads as expired without waiting out the ttl.
pub(super) async fn backdate_task_lock(store: &ProjectStore, task_id: &str, seconds_ago: i64) {
    let past = chrono::Utc::now().timestamp() - seconds_ago;
    sqlx::query("UPDATE task_locks SET expires_at = ? WHERE task_id = ?")
        .bind(past)
        .bind(task_id)
        .execute(store.pool())
        .await
        .expect("backdate lock");
}
