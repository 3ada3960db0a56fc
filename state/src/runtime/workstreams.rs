use super::*;
use crate::model::ParallelSession;
use crate::model::Workstream;
use crate::model::WorkstreamRow;
use crate::model::WorkstreamStatus;
use crate::model::epoch_seconds_to_datetime;
use crate::model::opt_epoch_seconds;

const WORKSTREAM_COLUMNS: &str = r#"
    id,
    session_id,
    branch_name,
    section_ids,
    clone_path,
    status,
    runner_id,
    lease_expires_at,
    recovery_attempts,
    next_retry_at,
    last_reconcile_action,
    last_reconciled_at,
    completed_at,
    created_at
"#;

impl GlobalStore {
    pub async fn create_parallel_session(
        &self,
        id: &str,
        project_path: &str,
    ) -> anyhow::Result<ParallelSession> {
        sqlx::query(
            r#"
INSERT INTO parallel_sessions (id, project_path, status, created_at)
VALUES (?, ?, 'running', ?)
            "#,
        )
        .bind(id)
        .bind(project_path)
        .bind(now_seconds())
        .execute(self.pool.as_ref())
        .await?;
        self.get_parallel_session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created parallel session {id}"))
    }

    pub async fn get_parallel_session(&self, id: &str) -> anyhow::Result<Option<ParallelSession>> {
        let row = sqlx::query(
            "SELECT id, project_path, status, created_at, completed_at FROM parallel_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ParallelSession {
            id: row.try_get("id")?,
            project_path: row.try_get("project_path")?,
            status: row.try_get("status")?,
            created_at: epoch_seconds_to_datetime(row.try_get("created_at")?)?,
            completed_at: opt_epoch_seconds(row.try_get("completed_at")?)?,
        }))
    }

    pub async fn set_parallel_session_status(
        &self,
        id: &str,
        status: &str,
        completed: bool,
    ) -> anyhow::Result<bool> {
        let completed_at = completed.then(now_seconds);
        let updated =
            sqlx::query("UPDATE parallel_sessions SET status = ?, completed_at = ? WHERE id = ?")
                .bind(status)
                .bind(completed_at)
                .bind(id)
                .execute(self.pool.as_ref())
                .await?
                .rows_affected();
        Ok(updated == 1)
    }

    pub async fn create_workstream(
        &self,
        id: &str,
        session_id: &str,
        branch_name: &str,
        section_ids: &[String],
        clone_path: Option<&str>,
    ) -> anyhow::Result<Workstream> {
        let section_ids_json = serde_json::to_string(section_ids)?;
        sqlx::query(
            r#"
INSERT INTO workstreams (id, session_id, branch_name, section_ids, clone_path, status, recovery_attempts, created_at)
VALUES (?, ?, ?, ?, ?, 'running', 0, ?)
            "#,
        )
        .bind(id)
        .bind(session_id)
        .bind(branch_name)
        .bind(section_ids_json)
        .bind(clone_path)
        .bind(now_seconds())
        .execute(self.pool.as_ref())
        .await?;
        self.get_workstream(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created workstream {id}"))
    }

    pub async fn get_workstream(&self, id: &str) -> anyhow::Result<Option<Workstream>> {
        let row = sqlx::query_as::<_, WorkstreamRow>(&format!(
            "SELECT {WORKSTREAM_COLUMNS} FROM workstreams WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Workstream::try_from).transpose()
    }

    pub async fn list_workstreams(&self, session_id: &str) -> anyhow::Result<Vec<Workstream>> {
        let rows = sqlx::query_as::<_, WorkstreamRow>(&format!(
            "SELECT {WORKSTREAM_COLUMNS} FROM workstreams WHERE session_id = ? ORDER BY created_at ASC"
        ))
        .bind(session_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Workstream::try_from).collect()
    }

    /// Take (or steal, when expired) the workstream lease. Same conditional
    /// shape as a task lease; arbitration is the store's atomic UPDATE.
    pub async fn claim_workstream(
        &self,
        id: &str,
        runner_id: &str,
        ttl: std::time::Duration,
    ) -> anyhow::Result<bool> {
        let now = now_seconds();
        let expires_at = now + ttl.as_secs() as i64;
        let updated = sqlx::query(
            r#"
UPDATE workstreams
SET runner_id = ?, lease_expires_at = ?
WHERE id = ?
  AND status = 'running'
  AND (runner_id IS NULL OR runner_id = ? OR lease_expires_at IS NULL OR lease_expires_at <= ?)
            "#,
        )
        .bind(runner_id)
        .bind(expires_at)
        .bind(id)
        .bind(runner_id)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    pub async fn set_workstream_status(
        &self,
        id: &str,
        status: WorkstreamStatus,
    ) -> anyhow::Result<bool> {
        let completed_at = matches!(
            status,
            WorkstreamStatus::Completed | WorkstreamStatus::Failed | WorkstreamStatus::Aborted
        )
        .then(now_seconds);
        let updated =
            sqlx::query("UPDATE workstreams SET status = ?, completed_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(completed_at)
                .bind(id)
                .execute(self.pool.as_ref())
                .await?
                .rows_affected();
        Ok(updated == 1)
    }

    /// Bump the retry counter and schedule the next reconcile attempt.
    pub async fn record_workstream_recovery_attempt(
        &self,
        id: &str,
        next_retry_delay: std::time::Duration,
        action: &str,
    ) -> anyhow::Result<bool> {
        let now = now_seconds();
        let updated = sqlx::query(
            r#"
UPDATE workstreams
SET recovery_attempts = recovery_attempts + 1,
    next_retry_at = ?,
    last_reconcile_action = ?,
    last_reconciled_at = ?
WHERE id = ?
            "#,
        )
        .bind(now + next_retry_delay.as_secs() as i64)
        .bind(action)
        .bind(now)
        .bind(id)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }
}

impl ProjectStore {
    /// Opaque merge bookkeeping: one row per workstream position applied,
    /// conflicted, or skipped during a session merge.
    pub async fn record_merge_progress(
        &self,
        session_id: &str,
        workstream_id: &str,
        position: i64,
        status: &str,
        commit_sha: Option<&str>,
        conflict_task_id: Option<&str>,
    ) -> anyhow::Result<i64> {
        let now = now_seconds();
        let applied_at = (status == "applied").then_some(now);
        let result = sqlx::query(
            r#"
INSERT INTO merge_progress (session_id, workstream_id, position, commit_sha, status, conflict_task_id, created_at, applied_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(workstream_id)
        .bind(position)
        .bind(commit_sha)
        .bind(status)
        .bind(conflict_task_id)
        .bind(now)
        .bind(applied_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.last_insert_rowid())
    }
}
