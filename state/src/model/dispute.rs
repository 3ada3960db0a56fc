use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use super::epoch_seconds_to_datetime;
use super::opt_epoch_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeStatus {
    Open,
    Resolved,
}

impl DisputeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            DisputeStatus::Open => "open",
            DisputeStatus::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            _ => Err(anyhow::anyhow!("invalid dispute status: {value}")),
        }
    }
}

/// A standoff between coder and reviewer, raised automatically when the
/// rejection cap is hit (if configured) or by an operator.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispute {
    pub id: String,
    pub task_id: String,
    pub kind: String,
    pub status: DisputeStatus,
    pub reason: Option<String>,
    pub coder_position: Option<String>,
    pub reviewer_position: Option<String>,
    pub resolution: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_by: String,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DisputeRow {
    pub(crate) id: String,
    pub(crate) task_id: String,
    #[sqlx(rename = "type")]
    pub(crate) kind: String,
    pub(crate) status: String,
    pub(crate) reason: Option<String>,
    pub(crate) coder_position: Option<String>,
    pub(crate) reviewer_position: Option<String>,
    pub(crate) resolution: Option<String>,
    pub(crate) resolution_notes: Option<String>,
    pub(crate) created_by: String,
    pub(crate) resolved_by: Option<String>,
    pub(crate) created_at: i64,
    pub(crate) resolved_at: Option<i64>,
}

impl TryFrom<DisputeRow> for Dispute {
    type Error = anyhow::Error;

    fn try_from(row: DisputeRow) -> Result<Self> {
        Ok(Dispute {
            status: DisputeStatus::parse(row.status.as_str())?,
            created_at: epoch_seconds_to_datetime(row.created_at)?,
            resolved_at: opt_epoch_seconds(row.resolved_at)?,
            id: row.id,
            task_id: row.task_id,
            kind: row.kind,
            reason: row.reason,
            coder_position: row.coder_position,
            reviewer_position: row.reviewer_position,
            resolution: row.resolution,
            resolution_notes: row.resolution_notes,
            created_by: row.created_by,
            resolved_by: row.resolved_by,
        })
    }
}
