//! Periodic sanitization: close runaway invocations and sweep expired
//! leases. Less aggressive than full recovery and safe to run on every
//! wakeup; the per-project interval gate is persisted in the store.

use tracing::info;
use tracing::warn;

use crate::config::HealthConfig;
use crate::review::ReviewDecision;
use crate::review::scan_for_decision;
use steroids_state::AuditParams;
use steroids_state::InvocationCloseParams;
use steroids_state::InvocationRole;
use steroids_state::InvocationStatus;
use steroids_state::ProjectStore;
use steroids_state::TaskStatus;

const LAST_RUN_KEY: &str = "sanitise_last_run_at";
const SANITIZER_ACTOR: &str = "sanitizer";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    /// True when the interval gate (or configuration) skipped the pass.
    pub skipped: bool,
    pub closed_invocations: u32,
    pub approved_reviews: u32,
    pub rejected_reviews: u32,
    pub expired_task_locks: u64,
    pub expired_section_locks: u64,
}

pub struct Sanitizer {
    store: ProjectStore,
    config: HealthConfig,
}

impl Sanitizer {
    pub fn new(store: ProjectStore, config: HealthConfig) -> Self {
        Self { store, config }
    }

    /// Run at most once per interval; `force` bypasses the gate (admin
    /// tooling).
    pub async fn run(&self, force: bool) -> anyhow::Result<SanitizeReport> {
        if !self.config.sanitise_enabled && !force {
            return Ok(SanitizeReport {
                skipped: true,
                ..Default::default()
            });
        }
        let now = chrono::Utc::now().timestamp();
        if !force && !self.interval_elapsed(now).await? {
            return Ok(SanitizeReport {
                skipped: true,
                ..Default::default()
            });
        }
        self.store.set_meta(LAST_RUN_KEY, &now.to_string()).await?;

        let mut report = SanitizeReport::default();
        let timeout_secs = self.config.sanitise_invocation_timeout_sec as i64;
        for invocation in self.store.list_running_invocations().await? {
            let age_secs = now - invocation.started_at_ms / 1000;
            if age_secs < timeout_secs {
                continue;
            }
            // A task under a live lease belongs to an active runner; leave
            // its invocation alone.
            if let Some(lock) = self.store.get_task_lock(&invocation.task_id).await?
                && lock.expires_at.timestamp() > now
            {
                continue;
            }
            self.close_runaway(&invocation, &mut report).await?;
        }

        let (expired_task_locks, expired_section_locks) =
            self.store.cleanup_expired_locks().await?;
        report.expired_task_locks = expired_task_locks;
        report.expired_section_locks = expired_section_locks;
        Ok(report)
    }

    async fn interval_elapsed(&self, now: i64) -> anyhow::Result<bool> {
        let Some(last_run) = self.store.get_meta(LAST_RUN_KEY).await? else {
            return Ok(true);
        };
        let Ok(last_run) = last_run.parse::<i64>() else {
            return Ok(true);
        };
        Ok(now - last_run >= (self.config.sanitise_interval_minutes as i64) * 60)
    }

    /// Close one runaway invocation. Reviewer invocations get a last chance:
    /// if the transcript carries a decision token, the verdict is honored
    /// before the invocation is closed.
    async fn close_runaway(
        &self,
        invocation: &steroids_state::Invocation,
        report: &mut SanitizeReport,
    ) -> anyhow::Result<()> {
        let decision = if invocation.role == InvocationRole::Reviewer {
            self.read_transcript_decision(invocation.id).await
        } else {
            None
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let audit = AuditParams::recovery(SANITIZER_ACTOR)
            .with_notes("runaway reviewer invocation closed by sanitizer");
        match decision {
            Some(ReviewDecision::Approve) => {
                let transitioned = self
                    .store
                    .transition_task_if(
                        &invocation.task_id,
                        TaskStatus::Review,
                        TaskStatus::Completed,
                        &audit,
                    )
                    .await?;
                if transitioned {
                    report.approved_reviews += 1;
                    info!(task_id = %invocation.task_id, "salvaged approval from runaway reviewer");
                }
                self.store
                    .close_invocation(
                        invocation.id,
                        &InvocationCloseParams {
                            status: InvocationStatus::Completed,
                            exit_code: 0,
                            response: invocation.response.clone(),
                            error: None,
                            completed_at_ms: now_ms,
                            success: true,
                            timed_out: false,
                        },
                    )
                    .await?;
            }
            Some(ReviewDecision::Reject) => {
                if self.store.record_rejection(&invocation.task_id, &audit).await? {
                    report.rejected_reviews += 1;
                }
                self.store
                    .close_invocation(
                        invocation.id,
                        &InvocationCloseParams {
                            status: InvocationStatus::Completed,
                            exit_code: 0,
                            response: invocation.response.clone(),
                            error: None,
                            completed_at_ms: now_ms,
                            success: true,
                            timed_out: false,
                        },
                    )
                    .await?;
            }
            None => {
                self.store
                    .close_invocation(
                        invocation.id,
                        &InvocationCloseParams {
                            status: InvocationStatus::Timeout,
                            exit_code: -1,
                            response: invocation.response.clone(),
                            error: Some("closed by sanitizer after exceeding the runaway timeout".to_string()),
                            completed_at_ms: now_ms,
                            success: false,
                            timed_out: true,
                        },
                    )
                    .await?;
            }
        }
        report.closed_invocations += 1;
        Ok(())
    }

    async fn read_transcript_decision(&self, invocation_id: i64) -> Option<ReviewDecision> {
        let path = self.store.paths().invocation_log_path(invocation_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => scan_for_decision(&text),
            Err(err) => {
                warn!(invocation_id, "could not read invocation transcript: {err}");
                None
            }
        }
    }
}
