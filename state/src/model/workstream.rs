use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use super::epoch_seconds_to_datetime;
use super::opt_epoch_seconds;

/// Grouping of runners operating on disjoint branches of one project.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelSession {
    pub id: String,
    pub project_path: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkstreamStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl WorkstreamStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkstreamStatus::Running => "running",
            WorkstreamStatus::Completed => "completed",
            WorkstreamStatus::Failed => "failed",
            WorkstreamStatus::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(anyhow::anyhow!("invalid workstream status: {value}")),
        }
    }
}

/// One branch of a parallel session. Carries its own lease so a stalled
/// workstream can be reclaimed with retry backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct Workstream {
    pub id: String,
    pub session_id: String,
    pub branch_name: String,
    pub section_ids: Vec<String>,
    pub clone_path: Option<String>,
    pub status: WorkstreamStatus,
    pub runner_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub recovery_attempts: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_reconcile_action: Option<String>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WorkstreamRow {
    pub(crate) id: String,
    pub(crate) session_id: String,
    pub(crate) branch_name: String,
    pub(crate) section_ids: String,
    pub(crate) clone_path: Option<String>,
    pub(crate) status: String,
    pub(crate) runner_id: Option<String>,
    pub(crate) lease_expires_at: Option<i64>,
    pub(crate) recovery_attempts: i64,
    pub(crate) next_retry_at: Option<i64>,
    pub(crate) last_reconcile_action: Option<String>,
    pub(crate) last_reconciled_at: Option<i64>,
    pub(crate) completed_at: Option<i64>,
    pub(crate) created_at: i64,
}

impl TryFrom<WorkstreamRow> for Workstream {
    type Error = anyhow::Error;

    fn try_from(row: WorkstreamRow) -> Result<Self> {
        let section_ids: Vec<String> = serde_json::from_str(row.section_ids.as_str())?;
        Ok(Workstream {
            status: WorkstreamStatus::parse(row.status.as_str())?,
            lease_expires_at: opt_epoch_seconds(row.lease_expires_at)?,
            next_retry_at: opt_epoch_seconds(row.next_retry_at)?,
            last_reconciled_at: opt_epoch_seconds(row.last_reconciled_at)?,
            completed_at: opt_epoch_seconds(row.completed_at)?,
            created_at: epoch_seconds_to_datetime(row.created_at)?,
            section_ids,
            id: row.id,
            session_id: row.session_id,
            branch_name: row.branch_name,
            clone_path: row.clone_path,
            runner_id: row.runner_id,
            last_reconcile_action: row.last_reconcile_action,
            recovery_attempts: row.recovery_attempts,
        })
    }
}
