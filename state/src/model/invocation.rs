use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use super::epoch_seconds_to_datetime;

/// Captured stdout/stderr are truncated at this many bytes per stream.
pub const OUTPUT_CAPTURE_LIMIT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationRole {
    Coder,
    Reviewer,
    Orchestrator,
}

impl InvocationRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            InvocationRole::Coder => "coder",
            InvocationRole::Reviewer => "reviewer",
            InvocationRole::Orchestrator => "orchestrator",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            "orchestrator" => Ok(Self::Orchestrator),
            _ => Err(anyhow::anyhow!("invalid invocation role: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl InvocationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            InvocationStatus::Running => "running",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Failed => "failed",
            InvocationStatus::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            _ => Err(anyhow::anyhow!("invalid invocation status: {value}")),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, InvocationStatus::Running)
    }
}

/// One external-process execution against a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub id: i64,
    pub task_id: String,
    pub role: InvocationRole,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub last_activity_at_ms: Option<i64>,
    pub status: InvocationStatus,
    pub exit_code: i64,
    pub duration_ms: i64,
    pub success: bool,
    pub timed_out: bool,
    pub rejection_number: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InvocationCreateParams {
    pub task_id: String,
    pub role: InvocationRole,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub started_at_ms: i64,
    pub rejection_number: Option<i64>,
}

/// Terminal fields written in one transaction when the invocation closes.
#[derive(Debug, Clone)]
pub struct InvocationCloseParams {
    pub status: InvocationStatus,
    pub exit_code: i64,
    pub response: Option<String>,
    pub error: Option<String>,
    pub completed_at_ms: i64,
    pub success: bool,
    pub timed_out: bool,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct InvocationRow {
    pub(crate) id: i64,
    pub(crate) task_id: String,
    pub(crate) role: String,
    pub(crate) provider: String,
    pub(crate) model: String,
    pub(crate) prompt: String,
    pub(crate) response: Option<String>,
    pub(crate) error: Option<String>,
    pub(crate) started_at_ms: i64,
    pub(crate) completed_at_ms: Option<i64>,
    pub(crate) last_activity_at_ms: Option<i64>,
    pub(crate) status: String,
    pub(crate) exit_code: i64,
    pub(crate) duration_ms: i64,
    pub(crate) success: i64,
    pub(crate) timed_out: i64,
    pub(crate) rejection_number: Option<i64>,
    pub(crate) created_at: i64,
}

impl TryFrom<InvocationRow> for Invocation {
    type Error = anyhow::Error;

    fn try_from(row: InvocationRow) -> Result<Self> {
        Ok(Invocation {
            role: InvocationRole::parse(row.role.as_str())?,
            status: InvocationStatus::parse(row.status.as_str())?,
            created_at: epoch_seconds_to_datetime(row.created_at)?,
            success: row.success != 0,
            timed_out: row.timed_out != 0,
            id: row.id,
            task_id: row.task_id,
            provider: row.provider,
            model: row.model,
            prompt: row.prompt,
            response: row.response,
            error: row.error,
            started_at_ms: row.started_at_ms,
            completed_at_ms: row.completed_at_ms,
            last_activity_at_ms: row.last_activity_at_ms,
            exit_code: row.exit_code,
            duration_ms: row.duration_ms,
            rejection_number: row.rejection_number,
        })
    }
}
