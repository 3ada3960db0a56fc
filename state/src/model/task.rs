use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use super::epoch_seconds_to_datetime;
use super::opt_epoch_seconds;

/// Rejections are capped; past this the loop refuses further coder runs and
/// either auto-disputes or fails the task.
pub const MAX_REJECTIONS: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Review,
    Completed,
    Disputed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Disputed => "disputed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            "disputed" => Ok(Self::Disputed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(anyhow::anyhow!("invalid task status: {value}")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Statuses the selector and the idle check consider live work.
    pub fn is_workable(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Review
        )
    }
}

/// Who performed a mutation, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Human,
    Runner,
    Recovery,
}

impl ActorType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ActorType::Human => "human",
            ActorType::Runner => "runner",
            ActorType::Recovery => "recovery",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "human" => Ok(Self::Human),
            "runner" => Ok(Self::Runner),
            "recovery" => Ok(Self::Recovery),
            _ => Err(anyhow::anyhow!("invalid actor type: {value}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub section_id: Option<String>,
    pub source_file: Option<String>,
    pub file_path: Option<String>,
    pub file_line: Option<i64>,
    pub file_commit_sha: Option<String>,
    pub file_content_hash: Option<String>,
    pub rejection_count: i64,
    pub failure_count: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskCreateParams {
    pub id: String,
    pub title: String,
    pub section_id: Option<String>,
    pub source_file: Option<String>,
    pub file_path: Option<String>,
    pub file_line: Option<i64>,
    pub file_commit_sha: Option<String>,
    pub file_content_hash: Option<String>,
}

/// Who/why for the audit row written alongside a status transition.
#[derive(Debug, Clone)]
pub struct AuditParams {
    pub actor: String,
    pub actor_type: ActorType,
    pub model: Option<String>,
    pub notes: Option<String>,
    pub commit_sha: Option<String>,
}

impl AuditParams {
    pub fn runner(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            actor_type: ActorType::Runner,
            model: None,
            notes: None,
            commit_sha: None,
        }
    }

    pub fn recovery(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            actor_type: ActorType::Recovery,
            model: None,
            notes: None,
            commit_sha: None,
        }
    }

    pub fn human(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            actor_type: ActorType::Human,
            model: None,
            notes: None,
            commit_sha: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_commit_sha(mut self, sha: impl Into<String>) -> Self {
        self.commit_sha = Some(sha.into());
        self
    }
}

/// A selectable task joined with its section ordering and current lease, as
/// one row of the selector's candidate query.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionCandidate {
    pub task: Task,
    pub section_position: Option<i64>,
    pub holder: Option<String>,
    pub lock_expires_at: Option<i64>,
}

impl SelectionCandidate {
    /// The lease blocks selection only while unexpired and foreign.
    pub fn held_by_other(&self, runner_id: &str, now_epoch_seconds: i64) -> bool {
        match (self.holder.as_deref(), self.lock_expires_at) {
            (Some(holder), Some(expires_at)) => {
                holder != runner_id && expires_at > now_epoch_seconds
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub review: i64,
    pub completed: i64,
    pub disputed: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl TaskCounts {
    /// True when nothing remains for any runner to pick up.
    pub fn all_done(&self) -> bool {
        self.pending == 0 && self.in_progress == 0 && self.review == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub id: i64,
    pub task_id: String,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    pub actor: String,
    pub actor_type: ActorType,
    pub model: Option<String>,
    pub notes: Option<String>,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) status: String,
    pub(crate) section_id: Option<String>,
    pub(crate) source_file: Option<String>,
    pub(crate) file_path: Option<String>,
    pub(crate) file_line: Option<i64>,
    pub(crate) file_commit_sha: Option<String>,
    pub(crate) file_content_hash: Option<String>,
    pub(crate) rejection_count: i64,
    pub(crate) failure_count: i64,
    pub(crate) last_failure_at: Option<i64>,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Task {
            status: TaskStatus::parse(row.status.as_str())?,
            last_failure_at: opt_epoch_seconds(row.last_failure_at)?,
            created_at: epoch_seconds_to_datetime(row.created_at)?,
            updated_at: epoch_seconds_to_datetime(row.updated_at)?,
            id: row.id,
            title: row.title,
            section_id: row.section_id,
            source_file: row.source_file,
            file_path: row.file_path,
            file_line: row.file_line,
            file_commit_sha: row.file_commit_sha,
            file_content_hash: row.file_content_hash,
            rejection_count: row.rejection_count,
            failure_count: row.failure_count,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AuditRow {
    pub(crate) id: i64,
    pub(crate) task_id: String,
    pub(crate) from_status: String,
    pub(crate) to_status: String,
    pub(crate) actor: String,
    pub(crate) actor_type: String,
    pub(crate) model: Option<String>,
    pub(crate) notes: Option<String>,
    pub(crate) commit_sha: Option<String>,
    pub(crate) created_at: i64,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = anyhow::Error;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(AuditEntry {
            from_status: TaskStatus::parse(row.from_status.as_str())?,
            to_status: TaskStatus::parse(row.to_status.as_str())?,
            actor_type: ActorType::parse(row.actor_type.as_str())?,
            created_at: epoch_seconds_to_datetime(row.created_at)?,
            id: row.id,
            task_id: row.task_id,
            actor: row.actor,
            model: row.model,
            notes: row.notes,
            commit_sha: row.commit_sha,
        })
    }
}
