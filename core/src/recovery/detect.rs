//! Pathology detection as a pure function of persisted state plus an
//! injected process-liveness probe.

use chrono::DateTime;
use chrono::Utc;
use std::collections::HashMap;

use crate::config::HealthConfig;
use steroids_state::FailureMode;
use steroids_state::Invocation;
use steroids_state::InvocationRole;
use steroids_state::Runner;
use steroids_state::RunnerStatus;
use steroids_state::Task;
use steroids_state::TaskStatus;

/// Answers "is this OS process alive?" — injected so detection stays a pure
/// function in tests.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: i64) -> bool;
}

/// Probes via signal 0, which checks existence without delivering anything.
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_alive(&self, pid: i64) -> bool {
        if pid <= 0 {
            return false;
        }
        // SAFETY: kill with signal 0 only performs the permission/existence
        // check.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
}

/// Everything detection reads, captured at one instant.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub now: DateTime<Utc>,
    pub project_path: String,
    /// Tasks with status in_progress or review.
    pub tasks: Vec<Task>,
    /// Latest invocation per task id (any status).
    pub latest_invocations: HashMap<String, Invocation>,
    /// All invocations still marked running.
    pub running_invocations: Vec<Invocation>,
    /// Global runner rows for this project.
    pub runners: Vec<Runner>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub failure_mode: FailureMode,
    pub task_id: Option<String>,
    pub runner_id: Option<String>,
    /// For hanging invocations: which phase hung.
    pub phase: Option<InvocationRole>,
    pub reason: String,
}

/// Classify every pathology visible in the snapshot. Runner-level
/// detections come first so the recovery pass can suppress their tasks from
/// the task-level pass.
pub fn detect(
    snapshot: &StateSnapshot,
    config: &HealthConfig,
    probe: &dyn ProcessProbe,
) -> Vec<Detection> {
    let mut detections = Vec::new();
    let now = snapshot.now.timestamp();

    for runner in &snapshot.runners {
        if runner.status != RunnerStatus::Running {
            continue;
        }
        let heartbeat_age = now - runner.heartbeat_at.timestamp();
        let alive = probe.is_alive(runner.pid);
        if !alive {
            detections.push(Detection {
                failure_mode: FailureMode::DeadRunner,
                task_id: runner.current_task_id.clone(),
                runner_id: Some(runner.id.clone()),
                phase: None,
                reason: format!("pid {} is gone", runner.pid),
            });
        } else if heartbeat_age > config.runner_heartbeat_timeout.as_secs() as i64 {
            detections.push(Detection {
                failure_mode: FailureMode::ZombieRunner,
                task_id: runner.current_task_id.clone(),
                runner_id: Some(runner.id.clone()),
                phase: None,
                reason: format!(
                    "pid {} alive but heartbeat is {heartbeat_age}s old",
                    runner.pid
                ),
            });
        }
    }

    for task in &snapshot.tasks {
        let updated_age = now - task.updated_at.timestamp();
        let latest = snapshot.latest_invocations.get(&task.id);
        let running = snapshot
            .running_invocations
            .iter()
            .find(|invocation| invocation.task_id == task.id);
        let assigned_runner = snapshot.runners.iter().find(|runner| {
            runner.project_path == snapshot.project_path
                && runner.current_task_id.as_deref() == Some(task.id.as_str())
        });
        let runner_fresh = assigned_runner.is_some_and(|runner| {
            now - runner.heartbeat_at.timestamp()
                <= config.runner_heartbeat_timeout.as_secs() as i64
        });

        if let Some(detection) =
            detect_hanging(task, running, runner_fresh, assigned_runner, now, config)
        {
            detections.push(detection);
            continue;
        }

        if task.status != TaskStatus::InProgress {
            continue;
        }

        if latest.is_none()
            && updated_age <= config.db_inconsistency_recent_update_sec as i64
        {
            // The runner claimed the task and has not yet written its first
            // invocation. Reported only; it resolves itself.
            detections.push(Detection {
                failure_mode: FailureMode::DbInconsistency,
                task_id: Some(task.id.clone()),
                runner_id: assigned_runner.map(|runner| runner.id.clone()),
                phase: None,
                reason: "in_progress with no invocations yet".to_string(),
            });
            continue;
        }

        let invocation_stale = match latest {
            None => true,
            Some(invocation) => {
                let started_age_secs = (snapshot.now.timestamp_millis()
                    - invocation.started_at_ms)
                    / 1000;
                started_age_secs > config.invocation_staleness.as_secs() as i64
            }
        };
        if updated_age > config.orphaned_task_timeout.as_secs() as i64
            && invocation_stale
            && !runner_fresh
        {
            detections.push(Detection {
                failure_mode: FailureMode::OrphanedTask,
                task_id: Some(task.id.clone()),
                runner_id: assigned_runner.map(|runner| runner.id.clone()),
                phase: None,
                reason: format!("no progress for {updated_age}s and no live runner"),
            });
        }
    }

    detections
}

fn detect_hanging(
    task: &Task,
    running: Option<&Invocation>,
    runner_fresh: bool,
    assigned_runner: Option<&Runner>,
    now: i64,
    config: &HealthConfig,
) -> Option<Detection> {
    if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Review) {
        return None;
    }
    let invocation = running?;
    if !runner_fresh {
        return None;
    }
    let phase = invocation.role;
    let hanging = match invocation.last_activity_at_ms {
        Some(last_activity_ms) => {
            let idle_secs = (now * 1000 - last_activity_ms) / 1000;
            idle_secs > config.invocation_staleness.as_secs() as i64
        }
        None => {
            let limit = match phase {
                InvocationRole::Reviewer => config.max_reviewer_duration.as_secs(),
                _ => config.max_coder_duration.as_secs(),
            };
            now - task.updated_at.timestamp() > limit as i64
        }
    };
    if !hanging {
        return None;
    }
    Some(Detection {
        failure_mode: FailureMode::HangingInvocation,
        task_id: Some(task.id.clone()),
        runner_id: assigned_runner.map(|runner| runner.id.clone()),
        phase: Some(phase),
        reason: format!("running {} invocation shows no activity", phase.as_str()),
    })
}
