use super::*;
use crate::model::FailureMode;
use crate::model::Incident;
use crate::model::IncidentCreateParams;
use crate::model::IncidentRow;
use crate::model::InvocationRole;
use crate::model::Resolution;

const INCIDENT_COLUMNS: &str = r#"
    id,
    task_id,
    runner_id,
    failure_mode,
    detected_at,
    resolved_at,
    resolution,
    details,
    created_at
"#;

impl ProjectStore {
    pub async fn record_incident(
        &self,
        params: &IncidentCreateParams,
    ) -> anyhow::Result<Incident> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_seconds();
        let details = params
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let (resolved_at, resolution) = match params.resolution {
            Some(resolution) => (Some(now), Some(resolution.as_str())),
            None => (None, None),
        };
        sqlx::query(
            r#"
INSERT INTO incidents (id, task_id, runner_id, failure_mode, detected_at, resolved_at, resolution, details, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(params.task_id.as_deref())
        .bind(params.runner_id.as_deref())
        .bind(params.failure_mode.as_str())
        .bind(now)
        .bind(resolved_at)
        .bind(resolution)
        .bind(details)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        self.get_incident(id.as_str())
            .await?
            .ok_or_else(|| anyhow::anyhow!("failed to load created incident {id}"))
    }

    pub async fn resolve_incident(
        &self,
        incident_id: &str,
        resolution: Resolution,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            "UPDATE incidents SET resolved_at = ?, resolution = ? WHERE id = ? AND resolved_at IS NULL",
        )
        .bind(now_seconds())
        .bind(resolution.as_str())
        .bind(incident_id)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    pub async fn get_incident(&self, incident_id: &str) -> anyhow::Result<Option<Incident>> {
        let row = sqlx::query_as::<_, IncidentRow>(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?"
        ))
        .bind(incident_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Incident::try_from).transpose()
    }

    /// Count of incidents detected in the trailing hour; recovery skips all
    /// actions at the configured ceiling.
    pub async fn incidents_in_last_hour(&self) -> anyhow::Result<i64> {
        let cutoff = now_seconds() - 3600;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM incidents WHERE detected_at >= ?")
            .bind(cutoff)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn list_open_incidents(&self) -> anyhow::Result<Vec<Incident>> {
        let rows = sqlx::query_as::<_, IncidentRow>(&format!(
            r#"
SELECT {INCIDENT_COLUMNS}
FROM incidents
WHERE resolved_at IS NULL
ORDER BY detected_at ASC
            "#
        ))
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Incident::try_from).collect()
    }

    /// The open credit incident for a provider/model/role triple detected in
    /// the trailing hour, if any. Used to dedupe pause entries.
    pub async fn open_credit_incident(
        &self,
        provider: &str,
        model: &str,
        role: InvocationRole,
    ) -> anyhow::Result<Option<Incident>> {
        let cutoff = now_seconds() - 3600;
        let details_key = credit_incident_details(provider, model, role);
        let rows = sqlx::query_as::<_, IncidentRow>(&format!(
            r#"
SELECT {INCIDENT_COLUMNS}
FROM incidents
WHERE failure_mode = ? AND resolved_at IS NULL AND detected_at >= ?
ORDER BY detected_at DESC
            "#
        ))
        .bind(FailureMode::CreditExhaustion.as_str())
        .bind(cutoff)
        .fetch_all(self.pool.as_ref())
        .await?;
        for row in rows {
            let incident = Incident::try_from(row)?;
            if incident.details.as_ref() == Some(&details_key) {
                return Ok(Some(incident));
            }
        }
        Ok(None)
    }
}

pub fn credit_incident_details(
    provider: &str,
    model: &str,
    role: InvocationRole,
) -> serde_json::Value {
    serde_json::json!({
        "provider": provider,
        "model": model,
        "role": role.as_str(),
    })
}
