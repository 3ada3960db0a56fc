//! Task selection: who picks what, in which order, and always with the
//! lease already held by the time a task is returned.

use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::heartbeat::LeaseGuard;
use steroids_state::AcquireOutcome;
use steroids_state::ProjectStore;
use steroids_state::SelectionCandidate;
use steroids_state::Task;
use steroids_state::TaskStatus;

/// Bound on claim-retry rounds within one selection pass; each round learns
/// at least one newly-discovered holder.
const MAX_CLAIM_ROUNDS: usize = 32;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Ordered section scope; empty means every section is eligible.
    pub section_scope: Vec<String>,
}

/// A task the calling runner now owns the lease on.
pub struct SelectedTask {
    pub task: Task,
    pub guard: LeaseGuard,
}

pub struct TaskSelector {
    store: ProjectStore,
    runner_id: String,
}

impl TaskSelector {
    pub fn new(store: ProjectStore, runner_id: String) -> Self {
        Self { store, runner_id }
    }

    /// Choose and lease the next task, or return None when no candidate is
    /// currently claimable. Losing a claim race extends the known-holder set
    /// and moves on to the next candidate, so a returned task is always
    /// owned.
    pub async fn select_next(
        &self,
        config: &SelectorConfig,
    ) -> anyhow::Result<Option<SelectedTask>> {
        let mut lost_to_race: HashSet<String> = HashSet::new();
        for _ in 0..MAX_CLAIM_ROUNDS {
            let candidates = self.store.list_selection_candidates().await?;
            let now = chrono::Utc::now().timestamp();
            let ranked = rank_candidates(
                candidates,
                &config.section_scope,
                &self.runner_id,
                now,
                &lost_to_race,
            );
            let Some(candidate) = ranked.into_iter().next() else {
                return Ok(None);
            };
            match self
                .store
                .acquire_task_lock(&candidate.task.id, &self.runner_id, config.lease_ttl)
                .await?
            {
                AcquireOutcome::Acquired(kind) => {
                    debug!(task_id = %candidate.task.id, ?kind, "leased task");
                    let guard = LeaseGuard::new(
                        self.store.clone(),
                        candidate.task.id.clone(),
                        self.runner_id.clone(),
                        config.heartbeat_interval,
                    );
                    return Ok(Some(SelectedTask {
                        task: candidate.task,
                        guard,
                    }));
                }
                AcquireOutcome::Locked { holder, .. } => {
                    debug!(task_id = %candidate.task.id, %holder, "lost claim race");
                    lost_to_race.insert(candidate.task.id);
                }
            }
        }
        Ok(None)
    }

    /// Batch mode: lease up to `max_batch_size` pending tasks from the same
    /// section. All-or-nothing: if any member lease fails, everything
    /// acquired so far is released and the batch is abandoned.
    pub async fn select_batch(
        &self,
        config: &SelectorConfig,
        max_batch_size: usize,
    ) -> anyhow::Result<Vec<SelectedTask>> {
        let candidates = self.store.list_selection_candidates().await?;
        let now = chrono::Utc::now().timestamp();
        let ranked = rank_candidates(
            candidates,
            &config.section_scope,
            &self.runner_id,
            now,
            &HashSet::new(),
        );
        let Some(head) = ranked
            .iter()
            .find(|candidate| candidate.task.status == TaskStatus::Pending)
        else {
            return Ok(Vec::new());
        };
        let section_id = head.task.section_id.clone();
        let members: Vec<Task> = ranked
            .into_iter()
            .filter(|candidate| {
                candidate.task.status == TaskStatus::Pending
                    && candidate.task.section_id == section_id
            })
            .take(max_batch_size.max(1))
            .map(|candidate| candidate.task)
            .collect();

        let mut selected: Vec<SelectedTask> = Vec::with_capacity(members.len());
        for task in members {
            let outcome = self
                .store
                .acquire_task_lock(&task.id, &self.runner_id, config.lease_ttl)
                .await?;
            if !outcome.is_acquired() {
                debug!(task_id = %task.id, "batch lease failed; releasing batch");
                for held in selected {
                    let _ = held.guard.release().await;
                }
                return Ok(Vec::new());
            }
            let guard = LeaseGuard::new(
                self.store.clone(),
                task.id.clone(),
                self.runner_id.clone(),
                config.heartbeat_interval,
            );
            selected.push(SelectedTask { task, guard });
        }
        Ok(selected)
    }

    /// Wait for a lease to become claimable, polling until `wait_timeout`.
    /// Returns None when cancelled, when the wait times out, or when all
    /// work is done (including holds that disappeared because their tasks
    /// completed).
    pub async fn select_waiting(
        &self,
        config: &SelectorConfig,
        poll_interval: Duration,
        wait_timeout: Duration,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<SelectedTask>> {
        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(selected) = self.select_next(config).await? {
                return Ok(Some(selected));
            }
            if self.store.task_counts().await?.all_done() {
                return Ok(None);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Order eligible candidates by the priority policy:
/// review first, then expired in_progress, then pending; within a tier by
/// section-scope order, then section position, then creation time. Tasks
/// under a live foreign lease (or just lost to a race) are excluded; the
/// caller's own lease never blocks.
pub fn rank_candidates(
    candidates: Vec<SelectionCandidate>,
    section_scope: &[String],
    runner_id: &str,
    now_epoch_seconds: i64,
    excluded: &HashSet<String>,
) -> Vec<SelectionCandidate> {
    let mut eligible: Vec<(SortKey, SelectionCandidate)> = candidates
        .into_iter()
        .filter(|candidate| !excluded.contains(&candidate.task.id))
        .filter(|candidate| !candidate.held_by_other(runner_id, now_epoch_seconds))
        .filter_map(|candidate| {
            let scope_index = if section_scope.is_empty() {
                0
            } else {
                let section_id = candidate.task.section_id.as_deref()?;
                section_scope.iter().position(|id| id == section_id)?
            };
            let key = SortKey {
                tier: status_tier(candidate.task.status)?,
                scope_index,
                section_position: candidate.section_position.unwrap_or(i64::MAX),
                created_at: candidate.task.created_at,
                id: candidate.task.id.clone(),
            };
            Some((key, candidate))
        })
        .collect();
    eligible.sort_by(|a, b| a.0.cmp(&b.0));
    eligible.into_iter().map(|(_, candidate)| candidate).collect()
}

fn status_tier(status: TaskStatus) -> Option<u8> {
    match status {
        TaskStatus::Review => Some(0),
        TaskStatus::InProgress => Some(1),
        TaskStatus::Pending => Some(2),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    tier: u8,
    scope_index: usize,
    section_position: i64,
    created_at: chrono::DateTime<chrono::Utc>,
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn candidate(
        id: &str,
        status: TaskStatus,
        section: Option<(&str, i64)>,
        created_at: i64,
        holder: Option<(&str, i64)>,
    ) -> SelectionCandidate {
        SelectionCandidate {
            task: Task {
                id: id.to_string(),
                title: id.to_string(),
                status,
                section_id: section.map(|(id, _)| id.to_string()),
                source_file: None,
                file_path: None,
                file_line: None,
                file_commit_sha: None,
                file_content_hash: None,
                rejection_count: 0,
                failure_count: 0,
                last_failure_at: None,
                created_at: chrono::Utc.timestamp_opt(created_at, 0).single().expect("ts"),
                updated_at: chrono::Utc.timestamp_opt(created_at, 0).single().expect("ts"),
            },
            section_position: section.map(|(_, position)| position),
            holder: holder.map(|(runner, _)| runner.to_string()),
            lock_expires_at: holder.map(|(_, expires)| expires),
        }
    }

    fn ids(ranked: &[SelectionCandidate]) -> Vec<&str> {
        ranked.iter().map(|c| c.task.id.as_str()).collect()
    }

    const NOW: i64 = 1_000_000;

    #[test]
    fn review_outranks_resume_outranks_pending() {
        let ranked = rank_candidates(
            vec![
                candidate("pend", TaskStatus::Pending, None, 1, None),
                candidate("rev", TaskStatus::Review, None, 3, None),
                candidate("prog", TaskStatus::InProgress, None, 2, None),
            ],
            &[],
            "r1",
            NOW,
            &HashSet::new(),
        );
        assert_eq!(ids(&ranked), vec!["rev", "prog", "pend"]);
    }

    #[test]
    fn within_a_tier_section_position_then_age_decides() {
        let ranked = rank_candidates(
            vec![
                candidate("late", TaskStatus::Pending, Some(("s2", 2)), 1, None),
                candidate("old", TaskStatus::Pending, Some(("s1", 1)), 5, None),
                candidate("older", TaskStatus::Pending, Some(("s1", 1)), 4, None),
            ],
            &[],
            "r1",
            NOW,
            &HashSet::new(),
        );
        assert_eq!(ids(&ranked), vec!["older", "old", "late"]);
    }

    #[test]
    fn live_foreign_leases_exclude_but_own_lease_does_not() {
        let ranked = rank_candidates(
            vec![
                candidate("theirs", TaskStatus::Pending, None, 1, Some(("r2", NOW + 600))),
                candidate("mine", TaskStatus::Pending, None, 2, Some(("r1", NOW + 600))),
                candidate("expired", TaskStatus::InProgress, None, 3, Some(("r2", NOW - 5))),
            ],
            &[],
            "r1",
            NOW,
            &HashSet::new(),
        );
        assert_eq!(ids(&ranked), vec!["expired", "mine"]);
    }

    #[test]
    fn scope_order_outranks_section_position() {
        let ranked = rank_candidates(
            vec![
                candidate("a", TaskStatus::Pending, Some(("s1", 1)), 1, None),
                candidate("b", TaskStatus::Pending, Some(("s9", 9)), 1, None),
                candidate("unscoped", TaskStatus::Pending, None, 1, None),
            ],
            &["s9".to_string(), "s1".to_string()],
            "r1",
            NOW,
            &HashSet::new(),
        );
        // s9 comes first because the scope list says so; the task without a
        // section is not eligible under a scope.
        assert_eq!(ids(&ranked), vec!["b", "a"]);
    }

    #[test]
    fn excluded_ids_are_skipped() {
        let mut excluded = HashSet::new();
        excluded.insert("first".to_string());
        let ranked = rank_candidates(
            vec![
                candidate("first", TaskStatus::Pending, None, 1, None),
                candidate("second", TaskStatus::Pending, None, 2, None),
            ],
            &[],
            "r1",
            NOW,
            &excluded,
        );
        assert_eq!(ids(&ranked), vec!["second"]);
    }
}
