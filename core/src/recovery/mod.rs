//! Stuck-task detection and conservative, idempotent recovery.

mod detect;
mod sanitize;

pub use detect::Detection;
pub use detect::ProcessProbe;
pub use detect::StateSnapshot;
pub use detect::SystemProcessProbe;
pub use detect::detect;
pub use sanitize::SanitizeReport;
pub use sanitize::Sanitizer;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing::warn;

use crate::config::HealthConfig;
use steroids_state::AuditParams;
use steroids_state::FailureMode;
use steroids_state::GlobalStore;
use steroids_state::IncidentCreateParams;
use steroids_state::InvocationCloseParams;
use steroids_state::InvocationStatus;
use steroids_state::ProjectStore;
use steroids_state::Resolution;
use steroids_state::TaskStatus;

/// Actor recorded on audit rows written by recovery.
const RECOVERY_ACTOR: &str = "health-monitor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAction {
    pub failure_mode: FailureMode,
    pub task_id: Option<String>,
    pub runner_id: Option<String>,
    pub resolution: Resolution,
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub detections: Vec<Detection>,
    pub actions: Vec<RecoveryAction>,
    /// True when the hourly incident ceiling suppressed all actions.
    pub rate_limited: bool,
}

pub struct RecoveryEngine {
    store: ProjectStore,
    global: GlobalStore,
    config: HealthConfig,
    probe: Arc<dyn ProcessProbe>,
    project_path: String,
    kill_grace: Duration,
}

impl RecoveryEngine {
    pub fn new(
        store: ProjectStore,
        global: GlobalStore,
        config: HealthConfig,
        probe: Arc<dyn ProcessProbe>,
        project_path: String,
    ) -> Self {
        Self {
            store,
            global,
            config,
            probe,
            project_path,
            kill_grace: crate::exec::KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Capture the detector's input at one instant.
    pub async fn snapshot(&self) -> anyhow::Result<StateSnapshot> {
        let mut tasks = self
            .store
            .list_tasks_with_status(TaskStatus::InProgress)
            .await?;
        tasks.extend(self.store.list_tasks_with_status(TaskStatus::Review).await?);

        let mut latest_invocations = HashMap::new();
        for task in &tasks {
            if let Some(invocation) = self.store.latest_invocation_for_task(&task.id).await? {
                latest_invocations.insert(task.id.clone(), invocation);
            }
        }

        Ok(StateSnapshot {
            now: chrono::Utc::now(),
            project_path: self.project_path.clone(),
            tasks,
            latest_invocations,
            running_invocations: self.store.list_running_invocations().await?,
            runners: self
                .global
                .list_runners_for_project(&self.project_path)
                .await?,
        })
    }

    /// One detection pass, optionally followed by recovery actions.
    ///
    /// With `apply=false` (or `health.autoRecover` off) detection still runs
    /// for reporting, but nothing is touched. Actions are idempotent: a
    /// second run against the same frozen state finds nothing left to do.
    pub async fn run(&self, apply: bool) -> anyhow::Result<RecoveryReport> {
        let snapshot = self.snapshot().await?;
        let detections = detect(&snapshot, &self.config, self.probe.as_ref());
        let mut report = RecoveryReport {
            detections,
            ..Default::default()
        };
        if report.detections.is_empty() || !apply || !self.config.auto_recover {
            return Ok(report);
        }

        let recent_incidents = self.store.incidents_in_last_hour().await?;
        if recent_incidents >= self.config.max_incidents_per_hour {
            warn!(
                recent_incidents,
                ceiling = self.config.max_incidents_per_hour,
                "incident ceiling reached; skipping recovery actions"
            );
            report.rate_limited = true;
            return Ok(report);
        }

        // Runner-level pathologies first, so the task pass does not
        // re-detect their tasks and charge a second failure.
        let mut handled_tasks: HashSet<String> = HashSet::new();
        let detections = report.detections.clone();
        for detection in &detections {
            match detection.failure_mode {
                FailureMode::ZombieRunner | FailureMode::DeadRunner => {
                    self.recover_runner(detection, &mut handled_tasks, &mut report.actions)
                        .await?;
                }
                _ => {}
            }
        }
        for detection in &detections {
            let Some(task_id) = detection.task_id.as_deref() else {
                continue;
            };
            if handled_tasks.contains(task_id) {
                continue;
            }
            match detection.failure_mode {
                FailureMode::HangingInvocation => {
                    self.recover_hanging_invocation(detection, &mut handled_tasks, &mut report.actions)
                        .await?;
                }
                FailureMode::OrphanedTask => {
                    handled_tasks.insert(task_id.to_string());
                    self.recover_orphaned_task(detection, &mut report.actions)
                        .await?;
                }
                _ => {}
            }
        }
        Ok(report)
    }

    /// Force-release the lease, charge one failure, and restart (or park)
    /// the task.
    async fn recover_orphaned_task(
        &self,
        detection: &Detection,
        actions: &mut Vec<RecoveryAction>,
    ) -> anyhow::Result<()> {
        let Some(task_id) = detection.task_id.as_deref() else {
            return Ok(());
        };
        self.store.force_release_task_lock(task_id).await?;
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };
        let exhausted = task.failure_count + 1 >= self.config.max_recovery_attempts;
        let (to, resolution) = if exhausted {
            (TaskStatus::Skipped, Resolution::Skipped)
        } else {
            (TaskStatus::Pending, Resolution::AutoRestart)
        };
        let audit = AuditParams::recovery(RECOVERY_ACTOR).with_notes(detection.reason.clone());
        let restarted = self.store.record_recovery_restart(task_id, to, &audit).await?;
        if !restarted {
            return Ok(());
        }
        info!(task_id, resolution = resolution.as_str(), "recovered task");
        self.store
            .record_incident(&IncidentCreateParams {
                task_id: Some(task_id.to_string()),
                runner_id: detection.runner_id.clone(),
                failure_mode: detection.failure_mode,
                resolution: Some(resolution),
                details: Some(serde_json::json!({ "reason": detection.reason })),
            })
            .await?;
        actions.push(RecoveryAction {
            failure_mode: detection.failure_mode,
            task_id: Some(task_id.to_string()),
            runner_id: detection.runner_id.clone(),
            resolution,
        });
        Ok(())
    }

    /// Kill the assigned runner, remove its registration, close the hung
    /// invocation, then run the orphaned-task recovery for its task.
    async fn recover_hanging_invocation(
        &self,
        detection: &Detection,
        handled_tasks: &mut HashSet<String>,
        actions: &mut Vec<RecoveryAction>,
    ) -> anyhow::Result<()> {
        let Some(task_id) = detection.task_id.as_deref() else {
            return Ok(());
        };
        handled_tasks.insert(task_id.to_string());

        if let Some(runner_id) = detection.runner_id.as_deref() {
            if let Some(runner) = self.global.get_runner(runner_id).await? {
                self.kill_process(runner.pid).await;
            }
            self.global.delete_runner(runner_id).await?;
        }
        if let Some(invocation) = self.store.running_invocation_for_task(task_id).await? {
            self.store
                .close_invocation(
                    invocation.id,
                    &InvocationCloseParams {
                        status: InvocationStatus::Timeout,
                        exit_code: -1,
                        response: None,
                        error: Some(detection.reason.clone()),
                        completed_at_ms: chrono::Utc::now().timestamp_millis(),
                        success: false,
                        timed_out: true,
                    },
                )
                .await?;
        }
        self.recover_orphaned_task(detection, actions).await
    }

    /// Zombie runners are killed; dead ones just cleaned up. Either way the
    /// lease is force-released, the task goes back to pending with one
    /// failure charged, and the registration row is deleted.
    async fn recover_runner(
        &self,
        detection: &Detection,
        handled_tasks: &mut HashSet<String>,
        actions: &mut Vec<RecoveryAction>,
    ) -> anyhow::Result<()> {
        let Some(runner_id) = detection.runner_id.as_deref() else {
            return Ok(());
        };
        let Some(runner) = self.global.get_runner(runner_id).await? else {
            return Ok(());
        };
        if detection.failure_mode == FailureMode::ZombieRunner {
            self.kill_process(runner.pid).await;
        }

        for lock in self.store.list_task_locks().await? {
            if lock.runner_id == runner_id {
                self.store.force_release_task_lock(&lock.task_id).await?;
            }
        }
        if let Some(task_id) = runner.current_task_id.as_deref() {
            handled_tasks.insert(task_id.to_string());
            let audit = AuditParams::recovery(RECOVERY_ACTOR).with_notes(detection.reason.clone());
            self.store
                .record_recovery_restart(task_id, TaskStatus::Pending, &audit)
                .await?;
        }
        self.global.delete_runner(runner_id).await?;

        info!(
            runner_id,
            failure_mode = detection.failure_mode.as_str(),
            "removed runner"
        );
        self.store
            .record_incident(&IncidentCreateParams {
                task_id: runner.current_task_id.clone(),
                runner_id: Some(runner_id.to_string()),
                failure_mode: detection.failure_mode,
                resolution: Some(Resolution::KilledRunner),
                details: Some(serde_json::json!({ "reason": detection.reason })),
            })
            .await?;
        actions.push(RecoveryAction {
            failure_mode: detection.failure_mode,
            task_id: runner.current_task_id,
            runner_id: Some(runner_id.to_string()),
            resolution: Resolution::KilledRunner,
        });
        Ok(())
    }

    /// Polite terminate, grace, forceful kill.
    async fn kill_process(&self, pid: i64) {
        if pid <= 0 {
            return;
        }
        // SAFETY: plain signal sends; the pid comes from our own registry.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        tokio::time::sleep(self.kill_grace).await;
        if self.probe.is_alive(pid) {
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
            tokio::time::sleep(self.kill_grace).await;
        }
    }
}
