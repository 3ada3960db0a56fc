use super::*;
use crate::model::Dispute;
use crate::model::DisputeRow;
use crate::model::DisputeStatus;

const DISPUTE_COLUMNS: &str = r#"
    id,
    task_id,
    type,
    status,
    reason,
    coder_position,
    reviewer_position,
    resolution,
    resolution_notes,
    created_by,
    resolved_by,
    created_at,
    resolved_at
"#;

impl ProjectStore {
    pub async fn create_dispute(
        &self,
        task_id: &str,
        kind: &str,
        reason: Option<&str>,
        created_by: &str,
    ) -> anyhow::Result<Dispute> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
INSERT INTO disputes (id, task_id, type, status, reason, created_by, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(task_id)
        .bind(kind)
        .bind(DisputeStatus::Open.as_str())
        .bind(reason)
        .bind(created_by)
        .bind(now_seconds())
        .execute(self.pool.as_ref())
        .await?;
        self.get_dispute(id.as_str())
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created dispute {id}"))
    }

    pub async fn get_dispute(&self, dispute_id: &str) -> anyhow::Result<Option<Dispute>> {
        let row = sqlx::query_as::<_, DisputeRow>(&format!(
            "SELECT {DISPUTE_COLUMNS} FROM disputes WHERE id = ?"
        ))
        .bind(dispute_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Dispute::try_from).transpose()
    }

    pub async fn list_open_disputes(&self) -> anyhow::Result<Vec<Dispute>> {
        let rows = sqlx::query_as::<_, DisputeRow>(&format!(
            r#"
SELECT {DISPUTE_COLUMNS}
FROM disputes
WHERE status = ?
ORDER BY created_at ASC
            "#
        ))
        .bind(DisputeStatus::Open.as_str())
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Dispute::try_from).collect()
    }

    pub async fn resolve_dispute(
        &self,
        dispute_id: &str,
        resolution: &str,
        resolution_notes: Option<&str>,
        resolved_by: &str,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            r#"
UPDATE disputes
SET status = ?, resolution = ?, resolution_notes = ?, resolved_by = ?, resolved_at = ?
WHERE id = ? AND status = ?
            "#,
        )
        .bind(DisputeStatus::Resolved.as_str())
        .bind(resolution)
        .bind(resolution_notes)
        .bind(resolved_by)
        .bind(now_seconds())
        .bind(dispute_id)
        .bind(DisputeStatus::Open.as_str())
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }
}
