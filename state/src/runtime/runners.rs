use super::*;
use crate::model::Runner;
use crate::model::RunnerRegistration;
use crate::model::RunnerRow;
use crate::model::RunnerStatus;

const RUNNER_COLUMNS: &str = r#"
    id,
    status,
    pid,
    project_path,
    current_task_id,
    section_id,
    parallel_session_id,
    started_at,
    heartbeat_at
"#;

impl GlobalStore {
    pub async fn register_runner(&self, params: &RunnerRegistration) -> anyhow::Result<Runner> {
        let now = now_seconds();
        sqlx::query(
            r#"
INSERT INTO runners (id, status, pid, project_path, current_task_id, section_id, parallel_session_id, started_at, heartbeat_at)
VALUES (?, ?, ?, ?, NULL, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    status = excluded.status,
    pid = excluded.pid,
    project_path = excluded.project_path,
    heartbeat_at = excluded.heartbeat_at
            "#,
        )
        .bind(params.id.as_str())
        .bind(RunnerStatus::Running.as_str())
        .bind(params.pid)
        .bind(params.project_path.as_str())
        .bind(params.section_id.as_deref())
        .bind(params.parallel_session_id.as_deref())
        .bind(now)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        let runner_id = params.id.as_str();
        self.get_runner(runner_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load registered runner {runner_id}"))
    }

    pub async fn get_runner(&self, runner_id: &str) -> anyhow::Result<Option<Runner>> {
        let row = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners WHERE id = ?"
        ))
        .bind(runner_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Runner::try_from).transpose()
    }

    pub async fn heartbeat_runner(&self, runner_id: &str) -> anyhow::Result<bool> {
        let updated = sqlx::query("UPDATE runners SET heartbeat_at = ? WHERE id = ?")
            .bind(now_seconds())
            .bind(runner_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    /// Point the registry at what the runner is working on right now.
    pub async fn set_runner_task(
        &self,
        runner_id: &str,
        current_task_id: Option<&str>,
        section_id: Option<&str>,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
UPDATE runners
SET current_task_id = ?, section_id = ?, heartbeat_at = ?
WHERE id = ?
            "#,
        )
        .bind(current_task_id)
        .bind(section_id)
        .bind(now_seconds())
        .bind(runner_id)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    pub async fn list_runners_for_project(
        &self,
        project_path: &str,
    ) -> anyhow::Result<Vec<Runner>> {
        let rows = sqlx::query_as::<_, RunnerRow>(&format!(
            r#"
SELECT {RUNNER_COLUMNS}
FROM runners
WHERE project_path = ?
ORDER BY started_at ASC
            "#
        ))
        .bind(project_path)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Runner::try_from).collect()
    }

    pub async fn list_runners(&self) -> anyhow::Result<Vec<Runner>> {
        let rows = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners ORDER BY started_at ASC"
        ))
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Runner::try_from).collect()
    }

    pub async fn delete_runner(&self, runner_id: &str) -> anyhow::Result<bool> {
        let deleted = sqlx::query("DELETE FROM runners WHERE id = ?")
            .bind(runner_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }

    /// Register or refresh a project in the global catalog.
    pub async fn upsert_project(&self, path: &str, name: &str) -> anyhow::Result<()> {
        let now = now_seconds();
        sqlx::query(
            r#"
INSERT INTO projects (path, name, registered_at, last_seen_at)
VALUES (?, ?, ?, ?)
ON CONFLICT(path) DO UPDATE SET last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(path)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// Append one line to the cross-project activity feed.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_activity(
        &self,
        project_path: &str,
        runner_id: Option<&str>,
        task_id: Option<&str>,
        task_title: Option<&str>,
        section_name: Option<&str>,
        final_status: Option<&str>,
        commit_message: Option<&str>,
        commit_sha: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO activity_log (project_path, runner_id, task_id, task_title, section_name, final_status, commit_message, commit_sha, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_path)
        .bind(runner_id)
        .bind(task_id)
        .bind(task_title)
        .bind(section_name)
        .bind(final_status)
        .bind(commit_message)
        .bind(commit_sha)
        .bind(now_seconds())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}
