use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use super::epoch_seconds_to_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Running,
    Stopped,
}

impl RunnerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            RunnerStatus::Running => "running",
            RunnerStatus::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            _ => Err(anyhow::anyhow!("invalid runner status: {value}")),
        }
    }
}

/// A long-running loop process registered in the global store.
#[derive(Debug, Clone, PartialEq)]
pub struct Runner {
    pub id: String,
    pub status: RunnerStatus,
    pub pid: i64,
    pub project_path: String,
    pub current_task_id: Option<String>,
    pub section_id: Option<String>,
    pub parallel_session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl Runner {
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.heartbeat_at
    }
}

#[derive(Debug, Clone)]
pub struct RunnerRegistration {
    pub id: String,
    pub pid: i64,
    pub project_path: String,
    pub section_id: Option<String>,
    pub parallel_session_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunnerRow {
    pub(crate) id: String,
    pub(crate) status: String,
    pub(crate) pid: i64,
    pub(crate) project_path: String,
    pub(crate) current_task_id: Option<String>,
    pub(crate) section_id: Option<String>,
    pub(crate) parallel_session_id: Option<String>,
    pub(crate) started_at: i64,
    pub(crate) heartbeat_at: i64,
}

impl TryFrom<RunnerRow> for Runner {
    type Error = anyhow::Error;

    fn try_from(row: RunnerRow) -> Result<Self> {
        Ok(Runner {
            status: RunnerStatus::parse(row.status.as_str())?,
            started_at: epoch_seconds_to_datetime(row.started_at)?,
            heartbeat_at: epoch_seconds_to_datetime(row.heartbeat_at)?,
            id: row.id,
            pid: row.pid,
            project_path: row.project_path,
            current_task_id: row.current_task_id,
            section_id: row.section_id,
            parallel_session_id: row.parallel_session_id,
        })
    }
}
