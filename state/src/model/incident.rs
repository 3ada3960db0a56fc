use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use super::epoch_seconds_to_datetime;
use super::opt_epoch_seconds;

/// Pathologies the detector classifies from persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureMode {
    OrphanedTask,
    HangingInvocation,
    ZombieRunner,
    DeadRunner,
    DbInconsistency,
    CreditExhaustion,
}

impl FailureMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureMode::OrphanedTask => "orphaned_task",
            FailureMode::HangingInvocation => "hanging_invocation",
            FailureMode::ZombieRunner => "zombie_runner",
            FailureMode::DeadRunner => "dead_runner",
            FailureMode::DbInconsistency => "db_inconsistency",
            FailureMode::CreditExhaustion => "credit_exhaustion",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "orphaned_task" => Ok(Self::OrphanedTask),
            "hanging_invocation" => Ok(Self::HangingInvocation),
            "zombie_runner" => Ok(Self::ZombieRunner),
            "dead_runner" => Ok(Self::DeadRunner),
            "db_inconsistency" => Ok(Self::DbInconsistency),
            "credit_exhaustion" => Ok(Self::CreditExhaustion),
            _ => Err(anyhow::anyhow!("invalid failure mode: {value}")),
        }
    }
}

/// What the recovery engine (or the credit-pause loop) did about an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    AutoRestart,
    Skipped,
    KilledRunner,
    ConfigChanged,
    Stopped,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Resolution::AutoRestart => "auto_restart",
            Resolution::Skipped => "skipped",
            Resolution::KilledRunner => "killed_runner",
            Resolution::ConfigChanged => "config_changed",
            Resolution::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "auto_restart" => Ok(Self::AutoRestart),
            "skipped" => Ok(Self::Skipped),
            "killed_runner" => Ok(Self::KilledRunner),
            "config_changed" => Ok(Self::ConfigChanged),
            "stopped" => Ok(Self::Stopped),
            _ => Err(anyhow::anyhow!("invalid resolution: {value}")),
        }
    }
}

/// Append-only record of a detected pathology. The hourly count of these
/// rate-limits auto-recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub id: String,
    pub task_id: Option<String>,
    pub runner_id: Option<String>,
    pub failure_mode: FailureMode,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IncidentCreateParams {
    pub task_id: Option<String>,
    pub runner_id: Option<String>,
    pub failure_mode: FailureMode,
    pub resolution: Option<Resolution>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct IncidentRow {
    pub(crate) id: String,
    pub(crate) task_id: Option<String>,
    pub(crate) runner_id: Option<String>,
    pub(crate) failure_mode: String,
    pub(crate) detected_at: i64,
    pub(crate) resolved_at: Option<i64>,
    pub(crate) resolution: Option<String>,
    pub(crate) details: Option<String>,
    pub(crate) created_at: i64,
}

impl TryFrom<IncidentRow> for Incident {
    type Error = anyhow::Error;

    fn try_from(row: IncidentRow) -> Result<Self> {
        let details = row
            .details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Incident {
            failure_mode: FailureMode::parse(row.failure_mode.as_str())?,
            detected_at: epoch_seconds_to_datetime(row.detected_at)?,
            resolved_at: opt_epoch_seconds(row.resolved_at)?,
            resolution: row.resolution.as_deref().map(Resolution::parse).transpose()?,
            created_at: epoch_seconds_to_datetime(row.created_at)?,
            details,
            id: row.id,
            task_id: row.task_id,
            runner_id: row.runner_id,
        })
    }
}
