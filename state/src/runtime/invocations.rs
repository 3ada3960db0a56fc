use super::*;
use crate::model::Invocation;
use crate::model::InvocationCloseParams;
use crate::model::InvocationCreateParams;
use crate::model::InvocationRole;
use crate::model::InvocationRow;
use crate::model::InvocationStatus;

const INVOCATION_COLUMNS: &str = r#"
    id,
    task_id,
    role,
    provider,
    model,
    prompt,
    response,
    error,
    started_at_ms,
    completed_at_ms,
    last_activity_at_ms,
    status,
    exit_code,
    duration_ms,
    success,
    timed_out,
    rejection_number,
    created_at
"#;

impl ProjectStore {
    /// Insert the `running` row at spawn time and return its id.
    pub async fn open_invocation(&self, params: &InvocationCreateParams) -> anyhow::Result<i64> {
        let result = sqlx::query(
            r#"
INSERT INTO task_invocations (
    task_id,
    role,
    provider,
    model,
    prompt,
    response,
    error,
    started_at_ms,
    completed_at_ms,
    last_activity_at_ms,
    status,
    exit_code,
    duration_ms,
    success,
    timed_out,
    rejection_number,
    created_at
) VALUES (?, ?, ?, ?, ?, NULL, NULL, ?, NULL, NULL, ?, 0, 0, 0, 0, ?, ?)
            "#,
        )
        .bind(params.task_id.as_str())
        .bind(params.role.as_str())
        .bind(params.provider.as_str())
        .bind(params.model.as_str())
        .bind(params.prompt.as_str())
        .bind(params.started_at_ms)
        .bind(InvocationStatus::Running.as_str())
        .bind(params.rejection_number)
        .bind(now_seconds())
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Stamp the latest observed output byte.
    pub async fn record_invocation_activity(
        &self,
        invocation_id: i64,
        at_ms: i64,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            "UPDATE task_invocations SET last_activity_at_ms = ? WHERE id = ? AND status = ?",
        )
        .bind(at_ms)
        .bind(invocation_id)
        .bind(InvocationStatus::Running.as_str())
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// Write every terminal field in one transaction. The guard on
    /// `status = 'running'` makes the close exactly-once: a sanitizer and a
    /// supervisor racing to close the same invocation cannot both win.
    pub async fn close_invocation(
        &self,
        invocation_id: i64,
        close: &InvocationCloseParams,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
UPDATE task_invocations
SET
    status = ?,
    exit_code = ?,
    response = ?,
    error = ?,
    completed_at_ms = ?,
    duration_ms = ? - started_at_ms,
    success = ?,
    timed_out = ?
WHERE id = ? AND status = ?
            "#,
        )
        .bind(close.status.as_str())
        .bind(close.exit_code)
        .bind(close.response.as_deref())
        .bind(close.error.as_deref())
        .bind(close.completed_at_ms)
        .bind(close.completed_at_ms)
        .bind(i64::from(close.success))
        .bind(i64::from(close.timed_out))
        .bind(invocation_id)
        .bind(InvocationStatus::Running.as_str())
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    pub async fn get_invocation(&self, invocation_id: i64) -> anyhow::Result<Option<Invocation>> {
        let row = sqlx::query_as::<_, InvocationRow>(&format!(
            "SELECT {INVOCATION_COLUMNS} FROM task_invocations WHERE id = ?"
        ))
        .bind(invocation_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Invocation::try_from).transpose()
    }

    pub async fn latest_invocation_for_task(
        &self,
        task_id: &str,
    ) -> anyhow::Result<Option<Invocation>> {
        let row = sqlx::query_as::<_, InvocationRow>(&format!(
            r#"
SELECT {INVOCATION_COLUMNS}
FROM task_invocations
WHERE task_id = ?
ORDER BY started_at_ms DESC, id DESC
LIMIT 1
            "#
        ))
        .bind(task_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Invocation::try_from).transpose()
    }

    pub async fn running_invocation_for_task(
        &self,
        task_id: &str,
    ) -> anyhow::Result<Option<Invocation>> {
        let row = sqlx::query_as::<_, InvocationRow>(&format!(
            r#"
SELECT {INVOCATION_COLUMNS}
FROM task_invocations
WHERE task_id = ? AND status = ?
ORDER BY started_at_ms DESC, id DESC
LIMIT 1
            "#
        ))
        .bind(task_id)
        .bind(InvocationStatus::Running.as_str())
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Invocation::try_from).transpose()
    }

    pub async fn list_running_invocations(&self) -> anyhow::Result<Vec<Invocation>> {
        let rows = sqlx::query_as::<_, InvocationRow>(&format!(
            r#"
SELECT {INVOCATION_COLUMNS}
FROM task_invocations
WHERE status = ?
ORDER BY started_at_ms ASC, id ASC
            "#
        ))
        .bind(InvocationStatus::Running.as_str())
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Invocation::try_from).collect()
    }

    pub async fn list_invocations_for_task(
        &self,
        task_id: &str,
        role: Option<InvocationRole>,
    ) -> anyhow::Result<Vec<Invocation>> {
        let rows = match role {
            Some(role) => {
                sqlx::query_as::<_, InvocationRow>(&format!(
                    r#"
SELECT {INVOCATION_COLUMNS}
FROM task_invocations
WHERE task_id = ? AND role = ?
ORDER BY started_at_ms ASC, id ASC
                    "#
                ))
                .bind(task_id)
                .bind(role.as_str())
                .fetch_all(self.pool.as_ref())
                .await?
            }
            None => {
                sqlx::query_as::<_, InvocationRow>(&format!(
                    r#"
SELECT {INVOCATION_COLUMNS}
FROM task_invocations
WHERE task_id = ?
ORDER BY started_at_ms ASC, id ASC
                    "#
                ))
                .bind(task_id)
                .fetch_all(self.pool.as_ref())
                .await?
            }
        };
        rows.into_iter().map(Invocation::try_from).collect()
    }
}
