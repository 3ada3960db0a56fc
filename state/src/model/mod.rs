mod dispute;
mod incident;
mod invocation;
mod lock;
mod runner;
mod section;
mod task;
mod workstream;

pub use dispute::Dispute;
pub use dispute::DisputeStatus;
pub use incident::FailureMode;
pub use incident::Incident;
pub use incident::IncidentCreateParams;
pub use incident::Resolution;
pub use invocation::Invocation;
pub use invocation::OUTPUT_CAPTURE_LIMIT_BYTES;
pub use invocation::InvocationCloseParams;
pub use invocation::InvocationCreateParams;
pub use invocation::InvocationRole;
pub use invocation::InvocationStatus;
pub use lock::AcquireOutcome;
pub use lock::AcquiredKind;
pub use lock::MergeLock;
pub use lock::ReleaseOutcome;
pub use lock::SectionLock;
pub use lock::TaskLock;
pub use runner::Runner;
pub use runner::RunnerRegistration;
pub use runner::RunnerStatus;
pub use section::Section;
pub use section::SectionCreateParams;
pub use task::ActorType;
pub use task::AuditEntry;
pub use task::AuditParams;
pub use task::MAX_REJECTIONS;
pub use task::SelectionCandidate;
pub use task::Task;
pub use task::TaskCounts;
pub use task::TaskCreateParams;
pub use task::TaskStatus;
pub use workstream::ParallelSession;
pub use workstream::Workstream;
pub use workstream::WorkstreamStatus;

pub(crate) use dispute::DisputeRow;
pub(crate) use incident::IncidentRow;
pub(crate) use invocation::InvocationRow;
pub(crate) use lock::SectionLockRow;
pub(crate) use lock::TaskLockRow;
pub(crate) use runner::RunnerRow;
pub(crate) use section::SectionRow;
pub(crate) use task::AuditRow;
pub(crate) use task::TaskRow;
pub(crate) use workstream::WorkstreamRow;

use chrono::DateTime;
use chrono::Utc;

/// Rows persist timestamps as UTC epoch seconds (`*_ms` columns as epoch
/// milliseconds); models carry `DateTime<Utc>`.
pub fn epoch_seconds_to_datetime(seconds: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {seconds}"))
}

pub(crate) fn opt_epoch_seconds(seconds: Option<i64>) -> anyhow::Result<Option<DateTime<Utc>>> {
    seconds.map(epoch_seconds_to_datetime).transpose()
}
