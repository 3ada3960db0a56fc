//! Lease heartbeats and scoped lease ownership.
//!
//! A heartbeat only marks liveness (`heartbeat_at`); it never advances
//! `expires_at`. Detection uses the distinction to tell an active hold from
//! an abandoned one.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use steroids_state::ProjectStore;
use steroids_state::ReleaseOutcome;

/// A long-lived ticker tied to one lease hold. Cancellable and idempotent;
/// stops on its own when the lease is no longer owned.
pub struct HeartbeatHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn spawn(
        store: ProjectStore,
        task_id: String,
        runner_id: String,
        interval: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the lease was just stamped by
            // acquire, so skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.heartbeat_task_lock(&task_id, &runner_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(%task_id, "lease no longer owned; stopping heartbeat");
                        break;
                    }
                    Err(err) => warn!(%task_id, "heartbeat failed: {err}"),
                }
            }
        });
        Self { shutdown, task }
    }

    /// Deterministic, observable shutdown.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            warn!("heartbeat task panicked: {err}");
        }
    }

    fn abort(&self) {
        self.shutdown.cancel();
    }
}

/// Scoped ownership of a task lease: holds the heartbeat ticker for the
/// lifetime of the hold and guarantees release on every exit path. Dropping
/// the guard without an explicit release performs a best-effort async
/// release.
pub struct LeaseGuard {
    store: ProjectStore,
    task_id: String,
    runner_id: String,
    heartbeat: Option<HeartbeatHandle>,
    released: bool,
}

impl LeaseGuard {
    /// Wrap an already-acquired lease and start its heartbeat.
    pub fn new(
        store: ProjectStore,
        task_id: String,
        runner_id: String,
        heartbeat_interval: Duration,
    ) -> Self {
        let heartbeat = HeartbeatHandle::spawn(
            store.clone(),
            task_id.clone(),
            runner_id.clone(),
            heartbeat_interval,
        );
        Self {
            store,
            task_id,
            runner_id,
            heartbeat: Some(heartbeat),
            released: false,
        }
    }

    pub fn task_id(&self) -> &str {
        self.task_id.as_str()
    }

    /// Stop the heartbeat and delete the lease. An expired or stolen lease
    /// reports `NotFound`/`NotOwner`; callers log and continue.
    pub async fn release(mut self) -> anyhow::Result<ReleaseOutcome> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        self.released = true;
        let outcome = self
            .store
            .release_task_lock(&self.task_id, &self.runner_id)
            .await?;
        if let ReleaseOutcome::NotOwner { holder } = &outcome {
            warn!(
                task_id = %self.task_id,
                %holder,
                "lease changed hands before release"
            );
        }
        Ok(outcome)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let store = self.store.clone();
        let task_id = std::mem::take(&mut self.task_id);
        let runner_id = std::mem::take(&mut self.runner_id);
        tokio::spawn(async move {
            if let Err(err) = store.release_task_lock(&task_id, &runner_id).await {
                warn!(%task_id, "deferred lease release failed: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steroids_state::AcquireOutcome;
    use steroids_state::OpenOptions;
    use steroids_state::TaskCreateParams;

    async fn store_with_task(task_id: &str) -> (tempfile::TempDir, ProjectStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProjectStore::open(dir.path(), &OpenOptions::default())
            .await
            .expect("open");
        store
            .create_task(&TaskCreateParams {
                id: task_id.to_string(),
                title: "t".to_string(),
                ..Default::default()
            })
            .await
            .expect("task");
        (dir, store)
    }

    #[tokio::test]
    async fn heartbeat_refreshes_liveness_until_stopped() {
        let (_dir, store) = store_with_task("t1").await;
        store
            .acquire_task_lock("t1", "r1", Duration::from_secs(600))
            .await
            .expect("acquire");

        let handle = HeartbeatHandle::spawn(
            store.clone(),
            "t1".to_string(),
            "r1".to_string(),
            Duration::from_millis(50),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop().await;

        let lock = store
            .get_task_lock("t1")
            .await
            .expect("get")
            .expect("lock exists");
        assert!(lock.heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn guard_release_returns_lease_and_stops_heartbeat() {
        let (_dir, store) = store_with_task("t1").await;
        let outcome = store
            .acquire_task_lock("t1", "r1", Duration::from_secs(600))
            .await
            .expect("acquire");
        assert!(outcome.is_acquired());

        let guard = LeaseGuard::new(
            store.clone(),
            "t1".to_string(),
            "r1".to_string(),
            Duration::from_secs(30),
        );
        let release = guard.release().await.expect("release");
        assert_eq!(release, ReleaseOutcome::Released);
        assert!(store.get_task_lock("t1").await.expect("get").is_none());

        // A second release attempt through the raw API reports NotFound.
        assert_eq!(
            store
                .release_task_lock("t1", "r1")
                .await
                .expect("release"),
            ReleaseOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_the_background() {
        let (_dir, store) = store_with_task("t1").await;
        store
            .acquire_task_lock("t1", "r1", Duration::from_secs(600))
            .await
            .expect("acquire");

        let guard = LeaseGuard::new(
            store.clone(),
            "t1".to_string(),
            "r1".to_string(),
            Duration::from_secs(30),
        );
        drop(guard);

        // The deferred release runs on a spawned task.
        for _ in 0..50 {
            if store.get_task_lock("t1").await.expect("get").is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("lease was not released after guard drop");
    }
}
