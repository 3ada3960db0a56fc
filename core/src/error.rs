use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use steroids_state::MigrationError;

/// The error taxonomy the loop, the CLI, and recovery react to.
#[derive(Debug, Error)]
pub enum SteroidsErr {
    #[error("task {task_id} is locked by {holder}")]
    TaskLocked { task_id: String, holder: String },
    #[error("no lease found for {id}")]
    LockNotFound { id: String },
    #[error("lease on {id} is held by {holder}; use force to release it")]
    PermissionDenied { id: String, holder: String },
    #[error(
        "migration {id} ({name}) checksum mismatch: recorded {recorded}, computed {computed}"
    )]
    ChecksumMismatch {
        id: i64,
        name: String,
        recorded: String,
        computed: String,
    },
    #[error(
        "store is at schema version {found} but this binary bundles migrations only through \
         {bundled}"
    )]
    SchemaAhead { found: i64, bundled: i64 },
    #[error("invocation produced no output for {idle_secs}s and was terminated")]
    ActivityTimeout { idle_secs: u64 },
    #[error("provider {provider} reports exhausted credits for model {model}")]
    CreditExhaustion { provider: String, model: String },
    #[error("provider CLI `{cli}` is not available on PATH")]
    ProviderUnavailable { cli: String },
    #[error("cancellation requested")]
    CancellationRequested,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SteroidsErr {
    /// Documented process exit-code mapping.
    pub fn exit_code(&self) -> i32 {
        match self {
            SteroidsErr::LockNotFound { .. } => 4,
            SteroidsErr::PermissionDenied { .. } => 5,
            SteroidsErr::TaskLocked { .. } => 6,
            SteroidsErr::CancellationRequested => 0,
            _ => 1,
        }
    }

    /// Stable machine-readable code for `--json` error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            SteroidsErr::TaskLocked { .. } => "task_locked",
            SteroidsErr::LockNotFound { .. } => "lock_not_found",
            SteroidsErr::PermissionDenied { .. } => "permission_denied",
            SteroidsErr::ChecksumMismatch { .. } => "checksum_mismatch",
            SteroidsErr::SchemaAhead { .. } => "schema_ahead",
            SteroidsErr::ActivityTimeout { .. } => "activity_timeout",
            SteroidsErr::CreditExhaustion { .. } => "credit_exhaustion",
            SteroidsErr::ProviderUnavailable { .. } => "provider_unavailable",
            SteroidsErr::CancellationRequested => "cancelled",
            SteroidsErr::Other(_) => "general",
        }
    }

    /// Structured fields for the `details` slot of the `--json` envelope.
    pub fn details(&self) -> Value {
        match self {
            SteroidsErr::TaskLocked { task_id, holder } => json!({
                "taskId": task_id,
                "holder": holder,
            }),
            SteroidsErr::LockNotFound { id } => json!({ "id": id }),
            SteroidsErr::PermissionDenied { id, holder } => json!({
                "id": id,
                "holder": holder,
            }),
            SteroidsErr::ChecksumMismatch {
                id,
                name,
                recorded,
                computed,
            } => json!({
                "migrationId": id,
                "migrationName": name,
                "recorded": recorded,
                "computed": computed,
            }),
            SteroidsErr::SchemaAhead { found, bundled } => json!({
                "found": found,
                "bundled": bundled,
            }),
            SteroidsErr::ActivityTimeout { idle_secs } => json!({ "idleSecs": idle_secs }),
            SteroidsErr::CreditExhaustion { provider, model } => json!({
                "provider": provider,
                "model": model,
            }),
            SteroidsErr::ProviderUnavailable { cli } => json!({ "cli": cli }),
            SteroidsErr::CancellationRequested | SteroidsErr::Other(_) => Value::Null,
        }
    }
}

impl From<MigrationError> for SteroidsErr {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::ChecksumMismatch {
                id,
                name,
                recorded,
                computed,
            } => SteroidsErr::ChecksumMismatch {
                id,
                name,
                recorded,
                computed,
            },
            MigrationError::SchemaAhead { found, bundled } => {
                SteroidsErr::SchemaAhead { found, bundled }
            }
            other => SteroidsErr::Other(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_codes_follow_the_documented_mapping() {
        let locked = SteroidsErr::TaskLocked {
            task_id: "t".into(),
            holder: "r".into(),
        };
        assert_eq!(locked.exit_code(), 6);
        assert_eq!(
            SteroidsErr::LockNotFound { id: "t".into() }.exit_code(),
            4
        );
        assert_eq!(
            SteroidsErr::PermissionDenied {
                id: "t".into(),
                holder: "r".into()
            }
            .exit_code(),
            5
        );
        assert_eq!(SteroidsErr::CancellationRequested.exit_code(), 0);
        assert_eq!(
            SteroidsErr::SchemaAhead {
                found: 9,
                bundled: 8
            }
            .exit_code(),
            1
        );
        assert_eq!(
            SteroidsErr::Other(anyhow::anyhow!("boom")).exit_code(),
            1
        );
    }

    #[test]
    fn migration_errors_keep_their_identity() {
        let err: SteroidsErr = MigrationError::SchemaAhead {
            found: 15,
            bundled: 8,
        }
        .into();
        assert_eq!(err.code(), "schema_ahead");
        assert_eq!(err.details(), serde_json::json!({ "found": 15, "bundled": 8 }));

        let err: SteroidsErr = MigrationError::ChecksumMismatch {
            id: 3,
            name: "leases".into(),
            recorded: "aaa".into(),
            computed: "bbb".into(),
        }
        .into();
        assert_eq!(err.code(), "checksum_mismatch");
        assert_eq!(err.details()["migrationId"], 3);
        assert_eq!(err.details()["recorded"], "aaa");

        // Everything else still collapses to the general bucket.
        let err: SteroidsErr = MigrationError::UnknownTarget {
            target: 99,
            bundled: 8,
        }
        .into();
        assert_eq!(err.code(), "general");
    }

    #[test]
    fn details_carry_the_variant_fields() {
        let locked = SteroidsErr::TaskLocked {
            task_id: "t1".into(),
            holder: "r2".into(),
        };
        assert_eq!(
            locked.details(),
            serde_json::json!({ "taskId": "t1", "holder": "r2" })
        );
        assert_eq!(SteroidsErr::CancellationRequested.details(), Value::Null);
    }
}
