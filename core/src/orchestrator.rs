//! The driver: select → lease → invoke coder → review → record → release,
//! with credit-exhaustion pauses, rejection-spiral intervention, and
//! cooperative cancellation at every suspension point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::config::load_config;
use crate::error::SteroidsErr;
use crate::exec::InvocationOutcome;
use crate::exec::InvocationRequest;
use crate::exec::InvocationSupervisor;
use crate::heartbeat::LeaseGuard;
use crate::hooks::HookEvent;
use crate::hooks::SharedHookSink;
use crate::hooks::emit;
use crate::providers::FailureKind;
use crate::providers::ProviderKind;
use crate::recovery::Sanitizer;
use crate::review::CoordinatorGuidance;
use crate::review::ReviewDecision;
use crate::review::parse_coordinator_response;
use crate::review::parse_review_decision;
use crate::selector::SelectedTask;
use crate::selector::SelectorConfig;
use crate::selector::TaskSelector;
use steroids_state::AuditParams;
use steroids_state::FailureMode;
use steroids_state::GlobalStore;
use steroids_state::IncidentCreateParams;
use steroids_state::InvocationRole;
use steroids_state::MAX_REJECTIONS;
use steroids_state::ProjectStore;
use steroids_state::Resolution;
use steroids_state::RunnerRegistration;
use steroids_state::SteroidsHome;
use steroids_state::Task;
use steroids_state::TaskStatus;
use steroids_state::credit_incident_details;

/// Fixed cadence of the credit-pause poll.
const CREDIT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Rejection count at which the coordinator is consulted before the next
/// coder run.
const COORDINATOR_THRESHOLD: i64 = 3;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub runner_id: String,
    pub section_scope: Vec<String>,
    /// Single-shot: process at most one task, and fail fast instead of
    /// entering the credit pause.
    pub once: bool,
    pub stream_output: bool,
    /// Overridable for tests; production uses the 30 s default.
    pub credit_poll_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            runner_id: format!("runner-{}", uuid::Uuid::new_v4()),
            section_scope: Vec::new(),
            once: false,
            stream_output: false,
            credit_poll_interval: CREDIT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// No pending, in_progress, or review work remains.
    Idle,
    /// The stop flag was honored; the current iteration was drained first.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: LoopOutcome,
    pub tasks_processed: u64,
}

pub struct Orchestrator {
    project_root: PathBuf,
    project_path: String,
    store: ProjectStore,
    global: GlobalStore,
    home: SteroidsHome,
    config: Config,
    options: OrchestratorOptions,
    cancel: CancellationToken,
    supervisor: InvocationSupervisor,
    selector: TaskSelector,
    hooks: Option<SharedHookSink>,
    guidance: Mutex<HashMap<String, CoordinatorGuidance>>,
}

impl Orchestrator {
    pub fn new(
        project_root: PathBuf,
        store: ProjectStore,
        global: GlobalStore,
        home: SteroidsHome,
        config: Config,
        options: OrchestratorOptions,
        hooks: Option<SharedHookSink>,
    ) -> Self {
        let project_path = project_root.display().to_string();
        let supervisor = InvocationSupervisor::new(store.clone());
        let selector = TaskSelector::new(store.clone(), options.runner_id.clone());
        Self {
            project_root,
            project_path,
            store,
            global,
            home,
            config,
            options,
            cancel: CancellationToken::new(),
            supervisor,
            selector,
            hooks,
            guidance: Mutex::new(HashMap::new()),
        }
    }

    /// The "should stop" flag; a signal handler flips it and the loop drains
    /// the current iteration before exiting.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn runner_id(&self) -> &str {
        self.options.runner_id.as_str()
    }

    /// Drive this runner until no work remains or cancellation is
    /// requested.
    pub async fn run(&self) -> Result<RunSummary, SteroidsErr> {
        self.register().await?;
        self.sweep_tmp().await;
        let sanitizer = Sanitizer::new(self.store.clone(), self.config.health.clone());
        if let Err(err) = sanitizer.run(false).await {
            warn!("sanitization on wakeup failed: {err}");
        }

        let result = self.run_loop(&sanitizer).await;
        if let Err(err) = self.global.delete_runner(self.runner_id()).await {
            warn!("failed to deregister runner: {err}");
        }
        result
    }

    async fn run_loop(&self, sanitizer: &Sanitizer) -> Result<RunSummary, SteroidsErr> {
        let selector_config = SelectorConfig {
            lease_ttl: self.config.locking.task_timeout.as_duration(),
            heartbeat_interval: self.config.runners.heartbeat_interval.as_duration(),
            section_scope: self.options.section_scope.clone(),
        };
        let mut tasks_processed = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunSummary {
                    outcome: LoopOutcome::Cancelled,
                    tasks_processed,
                });
            }
            if let Err(err) = self.global.heartbeat_runner(self.runner_id()).await {
                warn!("runner heartbeat failed: {err}");
            }
            if let Err(err) = sanitizer.run(false).await {
                warn!("periodic sanitization failed: {err}");
            }

            let mut batch = if self.config.sections.batch_mode {
                match self
                    .selector
                    .select_batch(&selector_config, self.config.sections.max_batch_size)
                    .await
                {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!("batch selection failed: {err}");
                        self.pause_after_error().await;
                        continue;
                    }
                }
            } else {
                Vec::new()
            };

            if batch.len() > 1 {
                match self.process_batch(batch).await {
                    Ok(processed) => tasks_processed += processed,
                    Err(SteroidsErr::CancellationRequested) => {
                        return Ok(RunSummary {
                            outcome: LoopOutcome::Cancelled,
                            tasks_processed,
                        });
                    }
                    Err(err) => {
                        // Transient: the leases are released by the guards;
                        // the work is picked back up on a later pass.
                        warn!("batch pass failed: {err}");
                        self.pause_after_error().await;
                    }
                }
                if self.options.once {
                    return Ok(RunSummary {
                        outcome: LoopOutcome::Idle,
                        tasks_processed,
                    });
                }
                continue;
            }

            let selected = match batch.pop() {
                Some(selected) => Some(selected),
                None => match self.selector.select_next(&selector_config).await {
                    Ok(selected) => selected,
                    Err(err) => {
                        warn!("task selection failed: {err}");
                        self.pause_after_error().await;
                        continue;
                    }
                },
            };
            let Some(selected) = selected else {
                if self.options.once {
                    return Ok(RunSummary {
                        outcome: LoopOutcome::Idle,
                        tasks_processed,
                    });
                }
                match self.store.task_counts().await {
                    Ok(counts) if counts.all_done() => {
                        info!("no workable tasks remain; exiting idle");
                        return Ok(RunSummary {
                            outcome: LoopOutcome::Idle,
                            tasks_processed,
                        });
                    }
                    Ok(_) => {}
                    Err(err) => warn!("task counts query failed: {err}"),
                }
                self.pause_after_error().await;
                continue;
            };

            match self.process_task(selected).await {
                Ok(()) => tasks_processed += 1,
                Err(SteroidsErr::CancellationRequested) => {
                    return Ok(RunSummary {
                        outcome: LoopOutcome::Cancelled,
                        tasks_processed,
                    });
                }
                Err(err) => {
                    // Transient store errors must not kill a long-running
                    // runner; the lease guard has already released (or will
                    // on drop), so log and take the next pass.
                    warn!("task pass failed: {err}");
                    self.pause_after_error().await;
                }
            }

            if self.options.once {
                return Ok(RunSummary {
                    outcome: LoopOutcome::Idle,
                    tasks_processed,
                });
            }
        }
    }

    /// Cancellable pause between retries, shared with the idle poll.
    async fn pause_after_error(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.locking.poll_interval.as_duration()) => {}
        }
    }

    /// One full pass over one leased task. The lease is released on every
    /// exit path; `LeaseGuard` covers the panic/error ones.
    async fn process_task(&self, selected: SelectedTask) -> Result<(), SteroidsErr> {
        let SelectedTask { task, guard } = selected;
        self.global
            .set_runner_task(self.runner_id(), Some(&task.id), task.section_id.as_deref())
            .await?;

        if task.status == TaskStatus::Pending {
            let transitioned = self
                .store
                .transition_task_if(
                    &task.id,
                    TaskStatus::Pending,
                    TaskStatus::InProgress,
                    &AuditParams::runner(self.runner_id()),
                )
                .await?;
            if transitioned {
                self.emit(HookEvent::TaskUpdated {
                    task_id: task.id.clone(),
                    from: TaskStatus::Pending,
                    to: TaskStatus::InProgress,
                });
            }
        }

        let Some(task) = self.store.get_task(&task.id).await? else {
            let _ = guard.release().await;
            return Ok(());
        };

        let result = match task.status {
            TaskStatus::InProgress => self.run_coder(&task).await,
            TaskStatus::Review => self.run_reviewer(&task).await,
            other => {
                debug!(task_id = %task.id, status = other.as_str(), "nothing to do");
                Ok(())
            }
        };

        let _ = guard.release().await;
        self.global
            .set_runner_task(self.runner_id(), None, None)
            .await?;
        result
    }

    /// One combined pass over a leased same-section batch: every member is
    /// started, a single coder invocation implements all of them, and the
    /// whole batch moves to review together. Review still happens per task
    /// on later iterations.
    async fn process_batch(&self, batch: Vec<SelectedTask>) -> Result<u64, SteroidsErr> {
        let Some(first) = batch.first() else {
            return Ok(0);
        };
        let processed = batch.len() as u64;
        self.global
            .set_runner_task(
                self.runner_id(),
                Some(&first.task.id),
                first.task.section_id.as_deref(),
            )
            .await?;

        let mut started = Vec::with_capacity(batch.len());
        for member in &batch {
            if member.task.status == TaskStatus::Pending {
                let transitioned = self
                    .store
                    .transition_task_if(
                        &member.task.id,
                        TaskStatus::Pending,
                        TaskStatus::InProgress,
                        &AuditParams::runner(self.runner_id()),
                    )
                    .await?;
                if transitioned {
                    self.emit(HookEvent::TaskUpdated {
                        task_id: member.task.id.clone(),
                        from: TaskStatus::Pending,
                        to: TaskStatus::InProgress,
                    });
                }
            }
            if let Some(task) = self.store.get_task(&member.task.id).await?
                && task.status == TaskStatus::InProgress
            {
                started.push(task);
            }
        }

        let result = if started.is_empty() {
            Ok(())
        } else {
            self.run_coder_batch(&started).await
        };

        for member in batch {
            let _ = member.guard.release().await;
        }
        self.global
            .set_runner_task(self.runner_id(), None, None)
            .await?;
        result.map(|()| processed)
    }

    async fn run_coder_batch(&self, tasks: &[Task]) -> Result<(), SteroidsErr> {
        let Some(head) = tasks.first() else {
            return Ok(());
        };
        let slot = self.config.ai.coder.clone();
        let Some(provider) = ProviderKind::from_name(&slot.provider) else {
            warn!(provider = %slot.provider, "unknown coder provider; leaving batch for the next pass");
            return Ok(());
        };
        let model = resolve_model(&slot.model, provider, InvocationRole::Coder);
        let prompt = self.build_coder_batch_prompt(tasks);
        for task in tasks {
            self.store.touch_task(&task.id).await?;
        }

        let outcome = self
            .supervisor
            .invoke(
                &InvocationRequest {
                    task_id: head.id.clone(),
                    role: InvocationRole::Coder,
                    provider,
                    model: model.clone(),
                    prompt,
                    cwd: self.project_root.clone(),
                    idle_timeout: self.config.runners.subprocess_hang_timeout.as_duration(),
                    custom_template: slot.cli.clone(),
                    stream_to_parent_stdio: self.options.stream_output,
                    rejection_number: None,
                },
                &self.cancel,
                None,
            )
            .await;

        match outcome {
            Ok(outcome) if outcome.success => {
                for task in tasks {
                    let transitioned = self
                        .store
                        .transition_task_if(
                            &task.id,
                            TaskStatus::InProgress,
                            TaskStatus::Review,
                            &AuditParams::runner(self.runner_id())
                                .with_notes("coder batch run complete"),
                        )
                        .await?;
                    if transitioned {
                        self.emit(HookEvent::TaskUpdated {
                            task_id: task.id.clone(),
                            from: TaskStatus::InProgress,
                            to: TaskStatus::Review,
                        });
                    }
                }
                Ok(())
            }
            Ok(outcome) if outcome.classification.kind == FailureKind::CreditExhaustion => {
                self.credit_pause(InvocationRole::Coder, provider.as_str(), &model)
                    .await?;
                Ok(())
            }
            Ok(outcome) => {
                for task in tasks {
                    self.handle_transient_coder_failure(task, &outcome).await?;
                }
                Ok(())
            }
            Err(SteroidsErr::ProviderUnavailable { cli }) => {
                warn!(%cli, "coder provider unavailable; treating as transient");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn build_coder_batch_prompt(&self, tasks: &[Task]) -> String {
        let mut prompt = format!(
            "You are the coder for a batch of {} tasks from the same section. \
             Implement all of them in one pass.\n\nTasks:\n",
            tasks.len()
        );
        for (index, task) in tasks.iter().enumerate() {
            prompt.push_str(&format!("{}. `{}`: {}\n", index + 1, task.id, task.title));
            if let Some(file_path) = task.file_path.as_deref() {
                prompt.push_str(&format!("   Anchor: {file_path}"));
                if let Some(line) = task.file_line {
                    prompt.push_str(&format!(":{line}"));
                }
                prompt.push('\n');
            }
        }
        prompt.push_str("\nImplement every task, then print TASK COMPLETE when done.\n");
        prompt
    }

    async fn run_coder(&self, task: &Task) -> Result<(), SteroidsErr> {
        if task.rejection_count >= MAX_REJECTIONS {
            return self.handle_rejection_cap(task).await;
        }
        let guidance = if task.rejection_count >= COORDINATOR_THRESHOLD {
            self.coordinate(task).await
        } else {
            None
        };
        if let Some(guidance) = guidance {
            self.guidance
                .lock()
                .map_err(|_| anyhow::anyhow!("guidance lock poisoned"))?
                .insert(task.id.clone(), guidance);
        }

        let slot = self.config.ai.coder.clone();
        let Some(provider) = ProviderKind::from_name(&slot.provider) else {
            warn!(provider = %slot.provider, "unknown coder provider; leaving task for the next pass");
            return Ok(());
        };
        let model = resolve_model(&slot.model, provider, InvocationRole::Coder);
        let prompt = self.build_coder_prompt(task)?;
        // Mark forward progress so a long resume is not mistaken for an
        // orphaned task.
        self.store.touch_task(&task.id).await?;

        let outcome = self
            .supervisor
            .invoke(
                &InvocationRequest {
                    task_id: task.id.clone(),
                    role: InvocationRole::Coder,
                    provider,
                    model: model.clone(),
                    prompt,
                    cwd: self.project_root.clone(),
                    idle_timeout: self.config.runners.subprocess_hang_timeout.as_duration(),
                    custom_template: slot.cli.clone(),
                    stream_to_parent_stdio: self.options.stream_output,
                    rejection_number: (task.rejection_count > 0).then_some(task.rejection_count),
                },
                &self.cancel,
                None,
            )
            .await;

        match outcome {
            Ok(outcome) if outcome.success => {
                let transitioned = self
                    .store
                    .transition_task_if(
                        &task.id,
                        TaskStatus::InProgress,
                        TaskStatus::Review,
                        &AuditParams::runner(self.runner_id()).with_notes("coder run complete"),
                    )
                    .await?;
                if transitioned {
                    self.emit(HookEvent::TaskUpdated {
                        task_id: task.id.clone(),
                        from: TaskStatus::InProgress,
                        to: TaskStatus::Review,
                    });
                }
                Ok(())
            }
            Ok(outcome) if outcome.classification.kind == FailureKind::CreditExhaustion => {
                self.credit_pause(InvocationRole::Coder, provider.as_str(), &model)
                    .await?;
                Ok(())
            }
            Ok(outcome) => self.handle_transient_coder_failure(task, &outcome).await,
            Err(SteroidsErr::ProviderUnavailable { cli }) => {
                warn!(%cli, "coder provider unavailable; treating as transient");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Transient coder failure: release + retry from pending, bounded by the
    /// task's failure budget; past the budget the task is parked as skipped
    /// (`failed` stays reserved for operator action).
    async fn handle_transient_coder_failure(
        &self,
        task: &Task,
        outcome: &InvocationOutcome,
    ) -> Result<(), SteroidsErr> {
        let exhausted = task.failure_count + 1 >= self.config.health.max_recovery_attempts;
        let to = if exhausted {
            TaskStatus::Skipped
        } else {
            TaskStatus::Pending
        };
        let note = if outcome.timed_out {
            "coder invocation timed out".to_string()
        } else {
            format!("coder invocation failed with exit code {}", outcome.exit_code)
        };
        warn!(task_id = %task.id, to = to.as_str(), "{note}");
        self.store
            .record_recovery_restart(
                &task.id,
                to,
                &AuditParams::runner(self.runner_id()).with_notes(note.clone()),
            )
            .await?;
        if exhausted {
            self.emit(HookEvent::TaskFailed {
                task_id: task.id.clone(),
                reason: note,
            });
        }
        Ok(())
    }

    async fn run_reviewer(&self, task: &Task) -> Result<(), SteroidsErr> {
        let slot = self.config.ai.reviewer.clone();
        let Some(provider) = ProviderKind::from_name(&slot.provider) else {
            warn!(provider = %slot.provider, "unknown reviewer provider; leaving task for the next pass");
            return Ok(());
        };
        let model = resolve_model(&slot.model, provider, InvocationRole::Reviewer);
        let prompt = self.build_reviewer_prompt(task)?;
        self.store.touch_task(&task.id).await?;

        let outcome = self
            .supervisor
            .invoke(
                &InvocationRequest {
                    task_id: task.id.clone(),
                    role: InvocationRole::Reviewer,
                    provider,
                    model: model.clone(),
                    prompt,
                    cwd: self.project_root.clone(),
                    idle_timeout: self.config.runners.subprocess_hang_timeout.as_duration(),
                    custom_template: slot.cli.clone(),
                    stream_to_parent_stdio: self.options.stream_output,
                    rejection_number: (task.rejection_count > 0).then_some(task.rejection_count),
                },
                &self.cancel,
                None,
            )
            .await;

        match outcome {
            Ok(outcome) if outcome.success => match parse_review_decision(&outcome.stdout) {
                Some(ReviewDecision::Approve) => self.approve(task).await,
                Some(ReviewDecision::Reject) => self.reject(task).await,
                None => {
                    warn!(task_id = %task.id, "reviewer returned no decision token; leaving in review");
                    Ok(())
                }
            },
            Ok(outcome) if outcome.classification.kind == FailureKind::CreditExhaustion => {
                self.credit_pause(InvocationRole::Reviewer, provider.as_str(), &model)
                    .await?;
                Ok(())
            }
            Ok(_) => {
                // Timeout or crash: transient. The lease is released by the
                // caller and the task stays in review for the next pass.
                warn!(task_id = %task.id, "reviewer invocation failed; leaving in review");
                Ok(())
            }
            Err(SteroidsErr::ProviderUnavailable { cli }) => {
                warn!(%cli, "reviewer provider unavailable; treating as transient");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn approve(&self, task: &Task) -> Result<(), SteroidsErr> {
        let transitioned = self
            .store
            .transition_task_if(
                &task.id,
                TaskStatus::Review,
                TaskStatus::Completed,
                &AuditParams::runner(self.runner_id()).with_notes("review approved"),
            )
            .await?;
        if !transitioned {
            return Ok(());
        }
        self.guidance
            .lock()
            .map_err(|_| anyhow::anyhow!("guidance lock poisoned"))?
            .remove(&task.id);
        self.emit(HookEvent::ReviewApproved {
            task_id: task.id.clone(),
        });
        self.emit(HookEvent::TaskCompleted {
            task_id: task.id.clone(),
            title: task.title.clone(),
        });
        self.global
            .append_activity(
                &self.project_path,
                Some(self.runner_id()),
                Some(&task.id),
                Some(&task.title),
                None,
                Some(TaskStatus::Completed.as_str()),
                None,
                None,
            )
            .await?;
        if let Some(section_id) = task.section_id.as_deref()
            && self.section_is_complete(section_id).await?
        {
            self.emit(HookEvent::SectionCompleted {
                section_id: section_id.to_string(),
            });
        }
        Ok(())
    }

    async fn reject(&self, task: &Task) -> Result<(), SteroidsErr> {
        let rejected = self
            .store
            .record_rejection(
                &task.id,
                &AuditParams::runner(self.runner_id()).with_notes("review rejected"),
            )
            .await?;
        if rejected {
            self.emit(HookEvent::ReviewRejected {
                task_id: task.id.clone(),
                rejection_count: task.rejection_count + 1,
            });
        }
        Ok(())
    }

    async fn section_is_complete(&self, section_id: &str) -> Result<bool, SteroidsErr> {
        let tasks = self.store.list_tasks().await?;
        Ok(tasks
            .iter()
            .filter(|task| task.section_id.as_deref() == Some(section_id))
            .all(|task| task.status.is_terminal() || task.status == TaskStatus::Disputed))
    }

    /// rejection_count has hit the hard cap: no more coder invocations.
    async fn handle_rejection_cap(&self, task: &Task) -> Result<(), SteroidsErr> {
        if self.config.disputes.auto_create_on_max_rejections {
            let dispute = self
                .store
                .create_dispute(
                    &task.id,
                    "max_rejections",
                    Some("rejection cap reached"),
                    self.runner_id(),
                )
                .await?;
            self.store
                .transition_task_if(
                    &task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Disputed,
                    &AuditParams::runner(self.runner_id()).with_notes("auto-dispute at rejection cap"),
                )
                .await?;
            self.emit(HookEvent::DisputeCreated {
                dispute_id: dispute.id,
                task_id: task.id.clone(),
            });
        } else {
            self.store
                .transition_task_if(
                    &task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Failed,
                    &AuditParams::runner(self.runner_id()).with_notes("rejection cap reached"),
                )
                .await?;
            self.emit(HookEvent::TaskFailed {
                task_id: task.id.clone(),
                reason: "rejection cap reached".to_string(),
            });
        }
        Ok(())
    }

    /// Durable pause on credit exhaustion: record a deduped incident, then
    /// poll for a config change that swaps the provider or model. Returns
    /// true when resumed, false when stopped by cancellation.
    async fn credit_pause(
        &self,
        role: InvocationRole,
        provider: &str,
        model: &str,
    ) -> Result<bool, SteroidsErr> {
        if self.options.once {
            return Err(SteroidsErr::CreditExhaustion {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }

        let incident = match self
            .store
            .open_credit_incident(provider, model, role)
            .await?
        {
            Some(existing) => existing,
            None => {
                self.emit(HookEvent::CreditExhausted {
                    provider: provider.to_string(),
                    model: model.to_string(),
                    role,
                });
                self.store
                    .record_incident(&IncidentCreateParams {
                        task_id: None,
                        runner_id: Some(self.runner_id().to_string()),
                        failure_mode: FailureMode::CreditExhaustion,
                        resolution: None,
                        details: Some(credit_incident_details(provider, model, role)),
                    })
                    .await?
            }
        };
        info!(provider, model, role = role.as_str(), "paused on credit exhaustion");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.store
                        .resolve_incident(&incident.id, Resolution::Stopped)
                        .await?;
                    self.emit(HookEvent::CreditResolved {
                        provider: provider.to_string(),
                        model: model.to_string(),
                        role,
                        resolution: Resolution::Stopped.as_str().to_string(),
                    });
                    return Ok(false);
                }
                _ = tokio::time::sleep(self.options.credit_poll_interval) => {}
            }
            self.global.heartbeat_runner(self.runner_id()).await?;
            let reloaded = load_config(&self.project_root, &self.home).await?;
            let slot = reloaded.ai.slot(role);
            let current = self.config.ai.slot(role);
            if slot.provider != current.provider || slot.model != current.model {
                info!(
                    provider = %slot.provider,
                    model = %slot.model,
                    "provider configuration changed; resuming"
                );
                self.store
                    .resolve_incident(&incident.id, Resolution::ConfigChanged)
                    .await?;
                self.emit(HookEvent::CreditResolved {
                    provider: provider.to_string(),
                    model: model.to_string(),
                    role,
                    resolution: Resolution::ConfigChanged.as_str().to_string(),
                });
                return Ok(true);
            }
        }
    }

    /// Consult the orchestrator-slot provider about a rejection spiral.
    /// Every failure path returns None; guidance is advisory.
    async fn coordinate(&self, task: &Task) -> Option<CoordinatorGuidance> {
        let slot = &self.config.ai.orchestrator;
        let provider = match ProviderKind::from_name(&slot.provider) {
            Some(provider) => provider,
            None => {
                warn!(provider = %slot.provider, "unknown coordinator provider; skipping intervention");
                return None;
            }
        };
        let model = resolve_model(&slot.model, provider, InvocationRole::Orchestrator);
        let prompt = match self.build_coordinator_prompt(task).await {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!("could not build coordinator prompt: {err}");
                return None;
            }
        };
        let outcome = self
            .supervisor
            .invoke(
                &InvocationRequest {
                    task_id: task.id.clone(),
                    role: InvocationRole::Orchestrator,
                    provider,
                    model,
                    prompt,
                    cwd: self.project_root.clone(),
                    idle_timeout: self.config.runners.subprocess_hang_timeout.as_duration(),
                    custom_template: slot.cli.clone(),
                    stream_to_parent_stdio: false,
                    rejection_number: Some(task.rejection_count),
                },
                &self.cancel,
                None,
            )
            .await;
        match outcome {
            Ok(outcome) if outcome.success => {
                let parsed = parse_coordinator_response(&outcome.stdout);
                if let Some(guidance) = &parsed {
                    info!(
                        task_id = %task.id,
                        decision = guidance.decision.as_str(),
                        "coordinator intervention"
                    );
                }
                parsed
            }
            Ok(_) | Err(_) => {
                warn!(task_id = %task.id, "coordinator invocation failed; proceeding without guidance");
                None
            }
        }
    }

    fn build_coder_prompt(&self, task: &Task) -> Result<String, SteroidsErr> {
        let mut prompt = format!(
            "You are the coder for task `{}`.\n\nTitle: {}\n",
            task.id, task.title
        );
        if let Some(file_path) = task.file_path.as_deref() {
            prompt.push_str(&format!("Anchor: {file_path}"));
            if let Some(line) = task.file_line {
                prompt.push_str(&format!(":{line}"));
            }
            prompt.push('\n');
        }
        if task.rejection_count > 0 {
            prompt.push_str(&format!(
                "\nThis task has been rejected {} time(s); address the review feedback.\n",
                task.rejection_count
            ));
        }
        self.append_guidance(&mut prompt, &task.id)?;
        prompt.push_str("\nImplement the task, then print TASK COMPLETE when done.\n");
        Ok(prompt)
    }

    fn build_reviewer_prompt(&self, task: &Task) -> Result<String, SteroidsErr> {
        let mut prompt = format!(
            "You are the reviewer for task `{}`.\n\nTitle: {}\n\n\
             Inspect the working tree and decide whether the implementation is complete and correct.\n",
            task.id, task.title
        );
        self.append_guidance(&mut prompt, &task.id)?;
        prompt.push_str(
            "\nEnd your response with exactly one decision line:\n\
             DECISION: APPROVE\nor\nDECISION: REJECT\n",
        );
        Ok(prompt)
    }

    fn append_guidance(&self, prompt: &mut String, task_id: &str) -> Result<(), SteroidsErr> {
        let guidance = self
            .guidance
            .lock()
            .map_err(|_| anyhow::anyhow!("guidance lock poisoned"))?;
        if let Some(guidance) = guidance.get(task_id) {
            prompt.push_str(&format!(
                "\nCoordinator guidance (read-only, decision: {}):\n{}\n",
                guidance.decision.as_str(),
                guidance.guidance
            ));
        }
        Ok(())
    }

    async fn build_coordinator_prompt(&self, task: &Task) -> anyhow::Result<String> {
        let reviews = self
            .store
            .list_invocations_for_task(&task.id, Some(InvocationRole::Reviewer))
            .await?;
        let mut prompt = format!(
            "Task `{}` ({}) has been rejected {} times. Review the rejection history and decide how to proceed.\n\nRejection history:\n",
            task.id, task.title, task.rejection_count
        );
        for invocation in reviews.iter().rev().take(5).rev() {
            let response = invocation.response.as_deref().unwrap_or("<no output>");
            prompt.push_str(&format!("--- attempt {} ---\n{}\n", invocation.id, response));
        }
        prompt.push_str(
            "\nRespond with exactly:\n\
             DECISION: guide_coder | override_reviewer | narrow_scope\n\
             GUIDANCE: <up to 500 words of guidance>\n",
        );
        Ok(prompt)
    }

    async fn register(&self) -> Result<(), SteroidsErr> {
        let name = self
            .project_root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.project_path.clone());
        self.global.upsert_project(&self.project_path, &name).await?;
        self.global
            .register_runner(&RunnerRegistration {
                id: self.options.runner_id.clone(),
                pid: i64::from(std::process::id()),
                project_path: self.project_path.clone(),
                section_id: self.options.section_scope.first().cloned(),
                parallel_session_id: None,
            })
            .await?;
        Ok(())
    }

    /// `.steroids/tmp` is scratch; sweep it on start.
    async fn sweep_tmp(&self) {
        let tmp = self.store.paths().tmp_dir();
        if let Err(err) = tokio::fs::remove_dir_all(&tmp).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            debug!("tmp sweep failed: {err}");
        }
        if let Err(err) = tokio::fs::create_dir_all(&tmp).await {
            debug!("tmp recreate failed: {err}");
        }
    }

    fn emit(&self, event: HookEvent) {
        emit(self.hooks.as_ref(), &self.project_path, &event);
    }
}

fn resolve_model(configured: &str, provider: ProviderKind, role: InvocationRole) -> String {
    if configured.is_empty() {
        provider.default_model(role).to_string()
    } else {
        configured.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_the_documented_credit_poll() {
        let options = OrchestratorOptions::default();
        assert_eq!(options.credit_poll_interval, Duration::from_secs(30));
        assert!(options.runner_id.starts_with("runner-"));
    }

    #[test]
    fn model_resolution_falls_back_to_provider_defaults() {
        assert_eq!(
            resolve_model("", ProviderKind::Claude, InvocationRole::Coder),
            ProviderKind::Claude.default_model(InvocationRole::Coder)
        );
        assert_eq!(
            resolve_model("custom-model", ProviderKind::Claude, InvocationRole::Coder),
            "custom-model"
        );
    }
}
