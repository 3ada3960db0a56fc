use super::*;
use crate::model::AcquireOutcome;
use crate::model::AcquiredKind;
use crate::model::MergeLock;
use crate::model::ReleaseOutcome;
use crate::model::SectionLock;
use crate::model::SectionLockRow;
use crate::model::TaskLock;
use crate::model::TaskLockRow;
use crate::model::epoch_seconds_to_datetime;

/// Contention retries: SQLite reports SQLITE_BUSY when the busy timeout
/// elapses under write contention.
const BUSY_ATTEMPTS: u32 = 3;
const BUSY_BACKOFF_MS: u64 = 50;

pub(crate) fn is_busy_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if db.message().contains("database is locked")
                || db.message().contains("database table is locked")
    )
}

impl ProjectStore {
    /// Acquire (or refresh) the lease on a task.
    ///
    /// The caller owns the lease iff the outcome is `Acquired`. Arbitration
    /// relies only on the store's transactional semantics: a fresh INSERT, an
    /// owner-matched refresh, or a conditional takeover of an expired row.
    /// A lease is claimable from the instant it expires; the previous owner
    /// re-acquiring at that same instant still reads as `AlreadyOwned`.
    pub async fn acquire_task_lock(
        &self,
        task_id: &str,
        runner_id: &str,
        ttl: std::time::Duration,
    ) -> anyhow::Result<AcquireOutcome> {
        let mut backoff = BUSY_BACKOFF_MS;
        let mut attempt = 1;
        loop {
            match self.acquire_task_lock_once(task_id, runner_id, ttl).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if attempt < BUSY_ATTEMPTS && is_busy_error(&err) => {
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn acquire_task_lock_once(
        &self,
        task_id: &str,
        runner_id: &str,
        ttl: std::time::Duration,
    ) -> Result<AcquireOutcome, sqlx::Error> {
        let now = now_seconds();
        let expires_at = now + ttl.as_secs() as i64;

        for _ in 0..2 {
            let inserted = sqlx::query(
                r#"
INSERT INTO task_locks (task_id, runner_id, acquired_at, expires_at, heartbeat_at)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT(task_id) DO NOTHING
                "#,
            )
            .bind(task_id)
            .bind(runner_id)
            .bind(now)
            .bind(expires_at)
            .bind(now)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
            if inserted == 1 {
                return Ok(AcquireOutcome::Acquired(AcquiredKind::New));
            }

            let Some(row) = self.fetch_task_lock_row(task_id).await? else {
                // The holder released between our INSERT and read; retry the
                // INSERT once.
                continue;
            };

            if row.runner_id == runner_id {
                sqlx::query(
                    r#"
UPDATE task_locks SET expires_at = ?, heartbeat_at = ?
WHERE task_id = ? AND runner_id = ?
                    "#,
                )
                .bind(expires_at)
                .bind(now)
                .bind(task_id)
                .bind(runner_id)
                .execute(self.pool.as_ref())
                .await?;
                return Ok(AcquireOutcome::Acquired(AcquiredKind::AlreadyOwned));
            }

            if row.expires_at <= now {
                let claimed = sqlx::query(
                    r#"
UPDATE task_locks
SET runner_id = ?, acquired_at = ?, expires_at = ?, heartbeat_at = ?
WHERE task_id = ? AND expires_at <= ?
                    "#,
                )
                .bind(runner_id)
                .bind(now)
                .bind(expires_at)
                .bind(now)
                .bind(task_id)
                .bind(now)
                .execute(self.pool.as_ref())
                .await?
                .rows_affected();
                if claimed == 1 {
                    return Ok(AcquireOutcome::Acquired(AcquiredKind::ClaimedExpired));
                }
                // Another runner claimed it first; report the now-current
                // holder.
                if let Some(current) = self.fetch_task_lock_row(task_id).await? {
                    return Ok(locked_outcome(current.runner_id, current.expires_at));
                }
                continue;
            }

            return Ok(locked_outcome(row.runner_id, row.expires_at));
        }

        match self.fetch_task_lock_row(task_id).await? {
            Some(row) => Ok(locked_outcome(row.runner_id, row.expires_at)),
            None => Ok(AcquireOutcome::Locked {
                holder: String::new(),
                expires_at: chrono::Utc::now(),
            }),
        }
    }

    async fn fetch_task_lock_row(&self, task_id: &str) -> Result<Option<TaskLockRow>, sqlx::Error> {
        sqlx::query_as::<_, TaskLockRow>(
            r#"
SELECT task_id, runner_id, acquired_at, expires_at, heartbeat_at
FROM task_locks
WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(self.pool.as_ref())
        .await
    }

    /// Delete the lease only when owned by `runner_id`. A missing or
    /// foreign-owned lease is reported, not raised: a caller whose lease
    /// expired mid-flight logs and continues.
    pub async fn release_task_lock(
        &self,
        task_id: &str,
        runner_id: &str,
    ) -> anyhow::Result<ReleaseOutcome> {
        let deleted = sqlx::query("DELETE FROM task_locks WHERE task_id = ? AND runner_id = ?")
            .bind(task_id)
            .bind(runner_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        if deleted == 1 {
            return Ok(ReleaseOutcome::Released);
        }
        match self.fetch_task_lock_row(task_id).await? {
            Some(row) => Ok(ReleaseOutcome::NotOwner {
                holder: row.runner_id,
            }),
            None => Ok(ReleaseOutcome::NotFound),
        }
    }

    /// Unconditional delete, used by recovery and admin tooling.
    pub async fn force_release_task_lock(&self, task_id: &str) -> anyhow::Result<bool> {
        let deleted = sqlx::query("DELETE FROM task_locks WHERE task_id = ?")
            .bind(task_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }

    /// Mark holder liveness. Never advances `expires_at`.
    pub async fn heartbeat_task_lock(
        &self,
        task_id: &str,
        runner_id: &str,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            "UPDATE task_locks SET heartbeat_at = ? WHERE task_id = ? AND runner_id = ?",
        )
        .bind(now_seconds())
        .bind(task_id)
        .bind(runner_id)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    pub async fn extend_task_lock(
        &self,
        task_id: &str,
        runner_id: &str,
        additional: std::time::Duration,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            "UPDATE task_locks SET expires_at = expires_at + ? WHERE task_id = ? AND runner_id = ?",
        )
        .bind(additional.as_secs() as i64)
        .bind(task_id)
        .bind(runner_id)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    /// Delete every expired task and section lease; returns (tasks, sections).
    pub async fn cleanup_expired_locks(&self) -> anyhow::Result<(u64, u64)> {
        let now = now_seconds();
        let tasks = sqlx::query("DELETE FROM task_locks WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        let sections = sqlx::query("DELETE FROM section_locks WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        Ok((tasks, sections))
    }

    pub async fn get_task_lock(&self, task_id: &str) -> anyhow::Result<Option<TaskLock>> {
        let row = self.fetch_task_lock_row(task_id).await?;
        row.map(TaskLock::try_from).transpose()
    }

    pub async fn list_task_locks(&self) -> anyhow::Result<Vec<TaskLock>> {
        let rows = sqlx::query_as::<_, TaskLockRow>(
            r#"
SELECT task_id, runner_id, acquired_at, expires_at, heartbeat_at
FROM task_locks
ORDER BY acquired_at ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(TaskLock::try_from).collect()
    }

    pub async fn list_expired_task_locks(&self) -> anyhow::Result<Vec<TaskLock>> {
        let rows = sqlx::query_as::<_, TaskLockRow>(
            r#"
SELECT task_id, runner_id, acquired_at, expires_at, heartbeat_at
FROM task_locks
WHERE expires_at <= ?
ORDER BY acquired_at ASC
            "#,
        )
        .bind(now_seconds())
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(TaskLock::try_from).collect()
    }

    /// Section leases mirror task leases without a heartbeat column.
    pub async fn acquire_section_lock(
        &self,
        section_id: &str,
        runner_id: &str,
        ttl: std::time::Duration,
    ) -> anyhow::Result<AcquireOutcome> {
        let now = now_seconds();
        let expires_at = now + ttl.as_secs() as i64;

        for _ in 0..2 {
            let inserted = sqlx::query(
                r#"
INSERT INTO section_locks (section_id, runner_id, acquired_at, expires_at)
VALUES (?, ?, ?, ?)
ON CONFLICT(section_id) DO NOTHING
                "#,
            )
            .bind(section_id)
            .bind(runner_id)
            .bind(now)
            .bind(expires_at)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
            if inserted == 1 {
                return Ok(AcquireOutcome::Acquired(AcquiredKind::New));
            }

            let Some(row) = self.fetch_section_lock_row(section_id).await? else {
                continue;
            };

            if row.runner_id == runner_id {
                sqlx::query(
                    "UPDATE section_locks SET expires_at = ? WHERE section_id = ? AND runner_id = ?",
                )
                .bind(expires_at)
                .bind(section_id)
                .bind(runner_id)
                .execute(self.pool.as_ref())
                .await?;
                return Ok(AcquireOutcome::Acquired(AcquiredKind::AlreadyOwned));
            }

            if row.expires_at <= now {
                let claimed = sqlx::query(
                    r#"
UPDATE section_locks
SET runner_id = ?, acquired_at = ?, expires_at = ?
WHERE section_id = ? AND expires_at <= ?
                    "#,
                )
                .bind(runner_id)
                .bind(now)
                .bind(expires_at)
                .bind(section_id)
                .bind(now)
                .execute(self.pool.as_ref())
                .await?
                .rows_affected();
                if claimed == 1 {
                    return Ok(AcquireOutcome::Acquired(AcquiredKind::ClaimedExpired));
                }
                if let Some(current) = self.fetch_section_lock_row(section_id).await? {
                    return Ok(locked_outcome(current.runner_id, current.expires_at));
                }
                continue;
            }

            return Ok(locked_outcome(row.runner_id, row.expires_at));
        }

        match self.fetch_section_lock_row(section_id).await? {
            Some(row) => Ok(locked_outcome(row.runner_id, row.expires_at)),
            None => Ok(AcquireOutcome::Locked {
                holder: String::new(),
                expires_at: chrono::Utc::now(),
            }),
        }
    }

    async fn fetch_section_lock_row(
        &self,
        section_id: &str,
    ) -> Result<Option<SectionLockRow>, sqlx::Error> {
        sqlx::query_as::<_, SectionLockRow>(
            r#"
SELECT section_id, runner_id, acquired_at, expires_at
FROM section_locks
WHERE section_id = ?
            "#,
        )
        .bind(section_id)
        .fetch_optional(self.pool.as_ref())
        .await
    }

    pub async fn release_section_lock(
        &self,
        section_id: &str,
        runner_id: &str,
    ) -> anyhow::Result<ReleaseOutcome> {
        let deleted =
            sqlx::query("DELETE FROM section_locks WHERE section_id = ? AND runner_id = ?")
                .bind(section_id)
                .bind(runner_id)
                .execute(self.pool.as_ref())
                .await?
                .rows_affected();
        if deleted == 1 {
            return Ok(ReleaseOutcome::Released);
        }
        match self.fetch_section_lock_row(section_id).await? {
            Some(row) => Ok(ReleaseOutcome::NotOwner {
                holder: row.runner_id,
            }),
            None => Ok(ReleaseOutcome::NotFound),
        }
    }

    pub async fn force_release_section_lock(&self, section_id: &str) -> anyhow::Result<bool> {
        let deleted = sqlx::query("DELETE FROM section_locks WHERE section_id = ?")
            .bind(section_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }

    pub async fn list_section_locks(&self) -> anyhow::Result<Vec<SectionLock>> {
        let rows = sqlx::query_as::<_, SectionLockRow>(
            r#"
SELECT section_id, runner_id, acquired_at, expires_at
FROM section_locks
ORDER BY acquired_at ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(SectionLock::try_from).collect()
    }

    /// Acquire the process-wide merge lease. At most one live row exists; an
    /// expired row is swept before the insert attempt.
    pub async fn acquire_merge_lock(
        &self,
        session_id: &str,
        runner_id: &str,
        ttl: std::time::Duration,
    ) -> anyhow::Result<AcquireOutcome> {
        let now = now_seconds();
        let expires_at = now + ttl.as_secs() as i64;

        sqlx::query("DELETE FROM merge_locks WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;

        let refreshed = sqlx::query(
            r#"
UPDATE merge_locks SET expires_at = ?, heartbeat_at = ?
WHERE runner_id = ? AND session_id = ?
            "#,
        )
        .bind(expires_at)
        .bind(now)
        .bind(runner_id)
        .bind(session_id)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        if refreshed == 1 {
            return Ok(AcquireOutcome::Acquired(AcquiredKind::AlreadyOwned));
        }

        let inserted = sqlx::query(
            r#"
INSERT INTO merge_locks (session_id, runner_id, acquired_at, expires_at, heartbeat_at)
SELECT ?, ?, ?, ?, ?
WHERE NOT EXISTS (SELECT 1 FROM merge_locks WHERE expires_at > ?)
            "#,
        )
        .bind(session_id)
        .bind(runner_id)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        if inserted == 1 {
            return Ok(AcquireOutcome::Acquired(AcquiredKind::New));
        }

        match self.get_merge_lock().await? {
            Some(lock) => Ok(AcquireOutcome::Locked {
                holder: lock.runner_id,
                expires_at: lock.expires_at,
            }),
            None => Ok(AcquireOutcome::Locked {
                holder: String::new(),
                expires_at: chrono::Utc::now(),
            }),
        }
    }

    pub async fn release_merge_lock(&self, runner_id: &str) -> anyhow::Result<bool> {
        let deleted = sqlx::query("DELETE FROM merge_locks WHERE runner_id = ?")
            .bind(runner_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn heartbeat_merge_lock(&self, runner_id: &str) -> anyhow::Result<bool> {
        let updated = sqlx::query("UPDATE merge_locks SET heartbeat_at = ? WHERE runner_id = ?")
            .bind(now_seconds())
            .bind(runner_id)
            .execute(self.pool.as_ref())
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    pub async fn get_merge_lock(&self) -> anyhow::Result<Option<MergeLock>> {
        let row = sqlx::query(
            r#"
SELECT id, session_id, runner_id, acquired_at, expires_at, heartbeat_at
FROM merge_locks
WHERE expires_at > ?
ORDER BY id ASC
LIMIT 1
            "#,
        )
        .bind(now_seconds())
        .fetch_optional(self.pool.as_ref())
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let heartbeat_at: Option<i64> = row.try_get("heartbeat_at")?;
        Ok(Some(MergeLock {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            runner_id: row.try_get("runner_id")?,
            acquired_at: epoch_seconds_to_datetime(row.try_get("acquired_at")?)?,
            expires_at: epoch_seconds_to_datetime(row.try_get("expires_at")?)?,
            heartbeat_at: heartbeat_at.map(epoch_seconds_to_datetime).transpose()?,
        }))
    }
}

fn locked_outcome(holder: String, expires_at: i64) -> AcquireOutcome {
    match epoch_seconds_to_datetime(expires_at) {
        Ok(expires_at) => AcquireOutcome::Locked { holder, expires_at },
        Err(_) => AcquireOutcome::Locked {
            holder,
            expires_at: chrono::Utc::now(),
        },
    }
}
