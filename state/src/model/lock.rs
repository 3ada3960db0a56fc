use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use super::epoch_seconds_to_datetime;
use super::opt_epoch_seconds;

/// How an `acquire` call obtained the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquiredKind {
    /// No row existed; a fresh lease was inserted.
    New,
    /// The caller already held the lease; expiry and heartbeat were refreshed.
    AlreadyOwned,
    /// An expired lease was atomically taken over from its previous holder.
    ClaimedExpired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Acquired(AcquiredKind),
    /// Another runner holds an unexpired lease.
    Locked {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Released,
    /// No lease row exists for the id.
    NotFound,
    /// A lease exists but belongs to someone else; only force-release may
    /// remove it.
    NotOwner { holder: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskLock {
    pub task_id: String,
    pub runner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionLock {
    pub section_id: String,
    pub runner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Global single-row lease held while a multi-workstream merge is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeLock {
    pub id: i64,
    pub session_id: String,
    pub runner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskLockRow {
    pub(crate) task_id: String,
    pub(crate) runner_id: String,
    pub(crate) acquired_at: i64,
    pub(crate) expires_at: i64,
    pub(crate) heartbeat_at: Option<i64>,
}

impl TryFrom<TaskLockRow> for TaskLock {
    type Error = anyhow::Error;

    fn try_from(row: TaskLockRow) -> Result<Self> {
        Ok(TaskLock {
            acquired_at: epoch_seconds_to_datetime(row.acquired_at)?,
            expires_at: epoch_seconds_to_datetime(row.expires_at)?,
            heartbeat_at: opt_epoch_seconds(row.heartbeat_at)?,
            task_id: row.task_id,
            runner_id: row.runner_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SectionLockRow {
    pub(crate) section_id: String,
    pub(crate) runner_id: String,
    pub(crate) acquired_at: i64,
    pub(crate) expires_at: i64,
}

impl TryFrom<SectionLockRow> for SectionLock {
    type Error = anyhow::Error;

    fn try_from(row: SectionLockRow) -> Result<Self> {
        Ok(SectionLock {
            acquired_at: epoch_seconds_to_datetime(row.acquired_at)?,
            expires_at: epoch_seconds_to_datetime(row.expires_at)?,
            section_id: row.section_id,
            runner_id: row.runner_id,
        })
    }
}
