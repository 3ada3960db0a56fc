use super::*;
use crate::model::AuditEntry;
use crate::model::AuditParams;
use crate::model::AuditRow;
use crate::model::SelectionCandidate;
use crate::model::Task;
use crate::model::TaskCounts;
use crate::model::TaskCreateParams;
use crate::model::TaskRow;
use crate::model::TaskStatus;

const TASK_COLUMNS: &str = r#"
    id,
    title,
    status,
    section_id,
    source_file,
    file_path,
    file_line,
    file_commit_sha,
    file_content_hash,
    rejection_count,
    failure_count,
    last_failure_at,
    created_at,
    updated_at
"#;

impl ProjectStore {
    pub async fn create_task(&self, params: &TaskCreateParams) -> anyhow::Result<Task> {
        let now = now_seconds();
        sqlx::query(
            r#"
INSERT INTO tasks (
    id,
    title,
    status,
    section_id,
    source_file,
    file_path,
    file_line,
    file_commit_sha,
    file_content_hash,
    rejection_count,
    failure_count,
    last_failure_at,
    created_at,
    updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, NULL, ?, ?)
            "#,
        )
        .bind(params.id.as_str())
        .bind(params.title.as_str())
        .bind(TaskStatus::Pending.as_str())
        .bind(params.section_id.as_deref())
        .bind(params.source_file.as_deref())
        .bind(params.file_path.as_deref())
        .bind(params.file_line)
        .bind(params.file_commit_sha.as_deref())
        .bind(params.file_content_hash.as_deref())
        .bind(now)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;

        let task_id = params.id.as_str();
        self.get_task(task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created task {task_id}"))
    }

    pub async fn get_task(&self, task_id: &str) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(task_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Task::try_from).transpose()
    }

    pub async fn list_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    pub async fn list_tasks_with_status(&self, status: TaskStatus) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Transition a task between two statuses, appending the audit row in the
    /// same transaction. Returns false (and writes nothing) when the task is
    /// no longer in `from`, which makes every caller's retry idempotent.
    pub async fn transition_task_if(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        audit: &AuditParams,
    ) -> anyhow::Result<bool> {
        if from == to {
            return Ok(false);
        }
        let now = now_seconds();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(now)
        .bind(task_id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Ok(false);
        }
        insert_audit(&mut tx, task_id, from, to, audit, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Transition from whatever the current status is. No-op when the task is
    /// missing or already at `to`.
    pub async fn transition_task(
        &self,
        task_id: &str,
        to: TaskStatus,
        audit: &AuditParams,
    ) -> anyhow::Result<bool> {
        let Some(task) = self.get_task(task_id).await? else {
            return Ok(false);
        };
        self.transition_task_if(task_id, task.status, to, audit).await
    }

    /// review → in_progress with the rejection counter bumped, one audit row.
    pub async fn record_rejection(
        &self,
        task_id: &str,
        audit: &AuditParams,
    ) -> anyhow::Result<bool> {
        let now = now_seconds();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
UPDATE tasks
SET status = ?, rejection_count = rejection_count + 1, updated_at = ?
WHERE id = ? AND status = ?
            "#,
        )
        .bind(TaskStatus::InProgress.as_str())
        .bind(now)
        .bind(task_id)
        .bind(TaskStatus::Review.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Ok(false);
        }
        insert_audit(
            &mut tx,
            task_id,
            TaskStatus::Review,
            TaskStatus::InProgress,
            audit,
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Recovery path: push a stuck in_progress/review task back to `pending`
    /// (or park it as `skipped`), charging one failure.
    pub async fn record_recovery_restart(
        &self,
        task_id: &str,
        to: TaskStatus,
        audit: &AuditParams,
    ) -> anyhow::Result<bool> {
        let Some(task) = self.get_task(task_id).await? else {
            return Ok(false);
        };
        if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Review) {
            return Ok(false);
        }
        let now = now_seconds();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
UPDATE tasks
SET status = ?, failure_count = failure_count + 1, last_failure_at = ?, updated_at = ?
WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(now)
        .bind(task_id)
        .bind(task.status.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated != 1 {
            return Ok(false);
        }
        insert_audit(&mut tx, task_id, task.status, to, audit, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Refresh updated_at without a transition, marking forward progress for
    /// the orphaned-task detector.
    pub async fn touch_task(&self, task_id: &str) -> anyhow::Result<bool> {
        let updated = sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
            .bind(now_seconds())
            .bind(task_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    /// Explicit purge; the only way a task row is destroyed.
    pub async fn purge_task(&self, task_id: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM audit WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_invocations WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_locks WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted == 1)
    }

    pub async fn task_counts(&self) -> anyhow::Result<TaskCounts> {
        let row = sqlx::query(
            r#"
SELECT
    SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
    SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END) AS in_progress,
    SUM(CASE WHEN status = 'review' THEN 1 ELSE 0 END) AS review,
    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
    SUM(CASE WHEN status = 'disputed' THEN 1 ELSE 0 END) AS disputed,
    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
    SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END) AS skipped
FROM tasks
            "#,
        )
        .fetch_one(self.pool.as_ref())
        .await?;
        let get = |name: &str| -> anyhow::Result<i64> {
            Ok(row.try_get::<Option<i64>, _>(name)?.unwrap_or(0))
        };
        Ok(TaskCounts {
            pending: get("pending")?,
            in_progress: get("in_progress")?,
            review: get("review")?,
            completed: get("completed")?,
            disputed: get("disputed")?,
            failed: get("failed")?,
            skipped: get("skipped")?,
        })
    }

    /// The selector's raw candidate set: every workable task with its section
    /// ordering and current lease, skipped sections excluded. Tiering and
    /// section-scope ordering happen in the selector.
    pub async fn list_selection_candidates(&self) -> anyhow::Result<Vec<SelectionCandidate>> {
        let rows = sqlx::query(
            r#"
SELECT
    t.id,
    t.title,
    t.status,
    t.section_id,
    t.source_file,
    t.file_path,
    t.file_line,
    t.file_commit_sha,
    t.file_content_hash,
    t.rejection_count,
    t.failure_count,
    t.last_failure_at,
    t.created_at,
    t.updated_at,
    s.position AS section_position,
    l.runner_id AS lock_runner_id,
    l.expires_at AS lock_expires_at
FROM tasks t
LEFT JOIN sections s ON s.id = t.section_id
LEFT JOIN task_locks l ON l.task_id = t.id
WHERE t.status IN ('pending', 'in_progress', 'review')
  AND COALESCE(s.skipped, 0) = 0
ORDER BY t.created_at ASC, t.id ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter()
            .map(|row| {
                let task = Task::try_from(TaskRow {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    status: row.try_get("status")?,
                    section_id: row.try_get("section_id")?,
                    source_file: row.try_get("source_file")?,
                    file_path: row.try_get("file_path")?,
                    file_line: row.try_get("file_line")?,
                    file_commit_sha: row.try_get("file_commit_sha")?,
                    file_content_hash: row.try_get("file_content_hash")?,
                    rejection_count: row.try_get("rejection_count")?,
                    failure_count: row.try_get("failure_count")?,
                    last_failure_at: row.try_get("last_failure_at")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })?;
                Ok(SelectionCandidate {
                    task,
                    section_position: row.try_get("section_position")?,
                    holder: row.try_get("lock_runner_id")?,
                    lock_expires_at: row.try_get("lock_expires_at")?,
                })
            })
            .collect()
    }

    pub async fn list_audit(&self, task_id: &str) -> anyhow::Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
SELECT id, task_id, from_status, to_status, actor, actor_type, model, notes, commit_sha, created_at
FROM audit
WHERE task_id = ?
ORDER BY id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }
}

async fn insert_audit(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
    audit: &AuditParams,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
INSERT INTO audit (task_id, from_status, to_status, actor, actor_type, model, notes, commit_sha, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(task_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(audit.actor.as_str())
    .bind(audit.actor_type.as_str())
    .bind(audit.model.as_deref())
    .bind(audit.notes.as_deref())
    .bind(audit.commit_sha.as_deref())
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
