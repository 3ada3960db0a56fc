//! SQLite-backed state for the task orchestrator.
//!
//! This crate owns the two stores: the project-local database under
//! `<project>/.steroids/` and the global database under the steroids home.
//! It applies ordered, checksum-verified schema migrations on open and
//! exposes the typed, transactional queries the lock protocol, the selector,
//! and the recovery engine rely on. Loop orchestration and process
//! supervision live in `steroids-core`.

mod migrations;
mod model;
mod paths;
mod runtime;

pub use migrations::Migration;
pub use migrations::MigrationError;
pub use migrations::bundled_global_migrations;
pub use migrations::bundled_project_migrations;
/// Preferred entrypoints: own a pool each and migrate on open.
pub use runtime::GlobalStore;
pub use runtime::OpenOptions;
pub use runtime::ProjectStore;
pub use runtime::credit_incident_details;
pub use runtime::schema_ddl;

pub use model::AcquireOutcome;
pub use model::AcquiredKind;
pub use model::ActorType;
pub use model::AuditEntry;
pub use model::AuditParams;
pub use model::MAX_REJECTIONS;
pub use model::SelectionCandidate;
pub use model::Dispute;
pub use model::DisputeStatus;
pub use model::FailureMode;
pub use model::Incident;
pub use model::IncidentCreateParams;
pub use model::Invocation;
pub use model::InvocationCloseParams;
pub use model::InvocationCreateParams;
pub use model::InvocationRole;
pub use model::InvocationStatus;
pub use model::MergeLock;
pub use model::OUTPUT_CAPTURE_LIMIT_BYTES;
pub use model::ParallelSession;
pub use model::ReleaseOutcome;
pub use model::Resolution;
pub use model::Runner;
pub use model::RunnerRegistration;
pub use model::RunnerStatus;
pub use model::Section;
pub use model::SectionCreateParams;
pub use model::SectionLock;
pub use model::Task;
pub use model::TaskCounts;
pub use model::TaskCreateParams;
pub use model::TaskLock;
pub use model::TaskStatus;
pub use model::Workstream;
pub use model::WorkstreamStatus;
pub use model::epoch_seconds_to_datetime;

pub use paths::SteroidsHome;
pub use paths::SteroidsPaths;
pub use paths::PROJECT_DB_FILENAME;
