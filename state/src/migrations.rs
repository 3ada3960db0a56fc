//! Ordered, checksum-verified schema migrations for both stores.
//!
//! Migrations are bundled into the binary. Each one applies inside a single
//! transaction: the up SQL, the `_migrations` log row, and the schema-version
//! write commit together, so a concurrent open observes either the previous
//! or the fully-migrated schema.

use sha2::Digest;
use sha2::Sha256;
use sqlx::Row;
use sqlx::SqlitePool;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;
use tracing::warn;

const SCHEMA_VERSION_KEY: &str = "schema_version";

#[derive(Debug, Error)]
pub enum MigrationError {
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
         {bundled}; refusing to open"
    )]
    SchemaAhead { found: i64, bundled: i64 },
    #[error("rollback target {target} is not a bundled migration id (0..={bundled})")]
    UnknownTarget { target: i64, bundled: i64 },
    #[error("migration {id} ({name}) failed: {source}")]
    Apply {
        id: i64,
        name: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// One bundled schema migration. The checksum is computed over the source
/// (id, name, up, down) when the bundle is built and re-verified before the
/// up SQL runs.
#[derive(Debug, Clone)]
pub struct Migration {
    pub id: i64,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
    checksum: String,
}

impl Migration {
    fn new(id: i64, name: &'static str, up: &'static str, down: &'static str) -> Self {
        let checksum = compute_checksum(id, name, up, down);
        Self {
            id,
            name,
            up,
            down,
            checksum,
        }
    }

    pub fn checksum(&self) -> &str {
        self.checksum.as_str()
    }

    fn verify_checksum(&self) -> Result<(), MigrationError> {
        let computed = compute_checksum(self.id, self.name, self.up, self.down);
        if computed != self.checksum {
            return Err(MigrationError::ChecksumMismatch {
                id: self.id,
                name: self.name.to_string(),
                recorded: self.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }
}

fn compute_checksum(id: i64, name: &str, up: &str, down: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string());
    hasher.update("\n");
    hasher.update(name);
    hasher.update("\n");
    hasher.update(up);
    hasher.update("\n");
    hasher.update(down);
    hex::encode(hasher.finalize())
}

/// Which store a pool belongs to; decides the schema-metadata table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreKind {
    Project,
    Global,
}

impl StoreKind {
    fn schema_table(self) -> &'static str {
        match self {
            StoreKind::Project => "_schema",
            StoreKind::Global => "_global_schema",
        }
    }
}

/// Side files copied along with the database on snapshot.
const WAL_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

#[derive(Debug, Clone)]
pub(crate) struct BackupSpec {
    pub(crate) db_path: PathBuf,
    pub(crate) backup_dir: PathBuf,
}

pub(crate) async fn ensure_meta_tables(
    pool: &SqlitePool,
    kind: StoreKind,
) -> Result<(), MigrationError> {
    let schema_table = kind.schema_table();
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {schema_table} (key TEXT PRIMARY KEY, value TEXT NOT NULL)"
    ))
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS _migrations (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    checksum TEXT NOT NULL,
    applied_at INTEGER NOT NULL
)
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn applied_version(pool: &SqlitePool) -> Result<i64, MigrationError> {
    let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS version FROM _migrations")
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("version")?)
}

/// Bring the store forward to the newest bundled migration.
///
/// Returns the number of migrations applied. Fails with [`MigrationError::SchemaAhead`]
/// when the store was written by a newer binary, and with
/// [`MigrationError::ChecksumMismatch`] when an applied migration's recorded
/// checksum no longer matches the bundled source.
pub(crate) async fn run_pending(
    pool: &SqlitePool,
    kind: StoreKind,
    migrations: &[Migration],
    backup: Option<&BackupSpec>,
) -> Result<usize, MigrationError> {
    ensure_meta_tables(pool, kind).await?;

    let bundled = migrations.last().map(|m| m.id).unwrap_or(0);
    let version = applied_version(pool).await?;
    if version > bundled {
        return Err(MigrationError::SchemaAhead {
            found: version,
            bundled,
        });
    }

    for migration in migrations {
        migration.verify_checksum()?;
    }
    verify_applied_checksums(pool, migrations).await?;

    let pending: Vec<&Migration> = migrations.iter().filter(|m| m.id > version).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    if let Some(spec) = backup {
        snapshot_store(spec).await;
    }

    for migration in &pending {
        apply_one(pool, kind, migration).await?;
        info!(id = migration.id, name = migration.name, "applied migration");
    }
    Ok(pending.len())
}

async fn verify_applied_checksums(
    pool: &SqlitePool,
    migrations: &[Migration],
) -> Result<(), MigrationError> {
    let rows = sqlx::query("SELECT id, name, checksum FROM _migrations ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let recorded: String = row.try_get("checksum")?;
        let Some(bundled) = migrations.iter().find(|m| m.id == id) else {
            continue;
        };
        if bundled.checksum() != recorded {
            return Err(MigrationError::ChecksumMismatch {
                id,
                name: bundled.name.to_string(),
                recorded,
                computed: bundled.checksum().to_string(),
            });
        }
    }
    Ok(())
}

async fn apply_one(
    pool: &SqlitePool,
    kind: StoreKind,
    migration: &Migration,
) -> Result<(), MigrationError> {
    let mut tx = pool.begin().await?;
    for statement in statements(migration.up) {
        if let Err(err) = sqlx::query(statement).execute(&mut *tx).await {
            if is_benign_schema_error(&err) {
                // The schema is already at the target state (manual repair,
                // re-created database). The migration row is still recorded.
                warn!(
                    id = migration.id,
                    name = migration.name,
                    "skipping already-applied statement: {err}"
                );
                continue;
            }
            return Err(MigrationError::Apply {
                id: migration.id,
                name: migration.name.to_string(),
                source: err,
            });
        }
    }
    let now = chrono::Utc::now().timestamp();
    sqlx::query("INSERT INTO _migrations (id, name, checksum, applied_at) VALUES (?, ?, ?, ?)")
        .bind(migration.id)
        .bind(migration.name)
        .bind(migration.checksum())
        .bind(now)
        .execute(&mut *tx)
        .await?;
    write_schema_version(&mut tx, kind, migration.id).await?;
    tx.commit().await?;
    Ok(())
}

/// Roll the store back to `target` (0 removes every migration), applying
/// down SQL in reverse id order.
pub(crate) async fn run_down(
    pool: &SqlitePool,
    kind: StoreKind,
    migrations: &[Migration],
    target: i64,
) -> Result<usize, MigrationError> {
    let bundled = migrations.last().map(|m| m.id).unwrap_or(0);
    if target < 0 || target > bundled {
        return Err(MigrationError::UnknownTarget { target, bundled });
    }
    let version = applied_version(pool).await?;
    let mut reverted = 0;
    for migration in migrations.iter().rev() {
        if migration.id <= target || migration.id > version {
            continue;
        }
        let mut tx = pool.begin().await?;
        for statement in statements(migration.down) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrationError::Apply {
                    id: migration.id,
                    name: migration.name.to_string(),
                    source,
                })?;
        }
        sqlx::query("DELETE FROM _migrations WHERE id = ?")
            .bind(migration.id)
            .execute(&mut *tx)
            .await?;
        write_schema_version(&mut tx, kind, migration.id - 1).await?;
        tx.commit().await?;
        info!(id = migration.id, name = migration.name, "reverted migration");
        reverted += 1;
    }
    Ok(reverted)
}

async fn write_schema_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    kind: StoreKind,
    version: i64,
) -> Result<(), MigrationError> {
    let schema_table = kind.schema_table();
    sqlx::query(&format!(
        "INSERT INTO {schema_table} (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value"
    ))
    .bind(SCHEMA_VERSION_KEY)
    .bind(version.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
}

fn is_benign_schema_error(err: &sqlx::Error) -> bool {
    let message = err.to_string();
    message.contains("duplicate column")
        || message.contains("table") && message.contains("already exists")
        || message.contains("index") && message.contains("already exists")
}

/// Copy-snapshot the store file and its WAL side files into the backup
/// directory. Failures are logged, never fatal.
async fn snapshot_store(spec: &BackupSpec) {
    if let Err(err) = tokio::fs::create_dir_all(&spec.backup_dir).await {
        warn!("skipping pre-migration backup, mkdir failed: {err}");
        return;
    }
    let mut sources = vec![spec.db_path.clone()];
    for suffix in WAL_SUFFIXES {
        let mut side = spec.db_path.as_os_str().to_owned();
        side.push(suffix);
        sources.push(PathBuf::from(side));
    }
    for source in sources {
        if !source.exists() {
            continue;
        }
        let Some(file_name) = source.file_name() else {
            continue;
        };
        let dest = spec.backup_dir.join(file_name);
        if let Err(err) = tokio::fs::copy(&source, &dest).await {
            warn!("pre-migration backup of {} failed: {err}", source.display());
        }
    }
}

/// Sorted DDL of every user table and index, for schema comparisons.
pub async fn schema_ddl(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT sql FROM sqlite_master WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%' \
         ORDER BY sql ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(|row| row.try_get("sql")).collect()
}

pub fn bundled_project_migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            "initial_catalog",
            r#"
CREATE TABLE sections (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    position INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 50,
    skipped INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    section_id TEXT REFERENCES sections(id),
    source_file TEXT,
    file_path TEXT,
    file_line INTEGER,
    file_commit_sha TEXT,
    file_content_hash TEXT,
    rejection_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX idx_tasks_status ON tasks(status);
CREATE INDEX idx_tasks_section_id ON tasks(section_id);
CREATE TABLE audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    actor TEXT NOT NULL,
    actor_type TEXT NOT NULL DEFAULT 'human',
    model TEXT,
    notes TEXT,
    commit_sha TEXT,
    created_at INTEGER NOT NULL
)
            "#,
            r#"
DROP TABLE audit;
DROP TABLE tasks;
DROP TABLE sections
            "#,
        ),
        Migration::new(
            2,
            "task_invocations",
            r#"
CREATE TABLE task_invocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    role TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    prompt TEXT NOT NULL,
    response TEXT,
    error TEXT,
    started_at_ms INTEGER NOT NULL,
    completed_at_ms INTEGER,
    last_activity_at_ms INTEGER,
    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed', 'timeout')),
    exit_code INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    timed_out INTEGER NOT NULL DEFAULT 0,
    rejection_number INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX idx_task_invocations_task_status
    ON task_invocations(task_id, status, started_at_ms DESC)
            "#,
            r#"
DROP TABLE task_invocations
            "#,
        ),
        Migration::new(
            3,
            "leases",
            r#"
CREATE TABLE task_locks (
    task_id TEXT PRIMARY KEY,
    runner_id TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    heartbeat_at INTEGER
);
CREATE INDEX idx_task_locks_expires_at ON task_locks(expires_at);
CREATE TABLE section_locks (
    section_id TEXT PRIMARY KEY,
    runner_id TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX idx_section_locks_expires_at ON section_locks(expires_at)
            "#,
            r#"
DROP TABLE section_locks;
DROP TABLE task_locks
            "#,
        ),
        Migration::new(
            4,
            "section_dependencies",
            r#"
CREATE TABLE section_dependencies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    section_id TEXT NOT NULL REFERENCES sections(id),
    depends_on_section_id TEXT NOT NULL REFERENCES sections(id),
    UNIQUE (section_id, depends_on_section_id)
)
            "#,
            r#"
DROP TABLE section_dependencies
            "#,
        ),
        Migration::new(
            5,
            "incidents",
            r#"
CREATE TABLE incidents (
    id TEXT PRIMARY KEY,
    task_id TEXT REFERENCES tasks(id),
    runner_id TEXT,
    failure_mode TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    resolved_at INTEGER,
    resolution TEXT,
    details TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX idx_incidents_detected_at ON incidents(detected_at)
            "#,
            r#"
DROP TABLE incidents
            "#,
        ),
        Migration::new(
            6,
            "disputes",
            r#"
CREATE TABLE disputes (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    reason TEXT,
    coder_position TEXT,
    reviewer_position TEXT,
    resolution TEXT,
    resolution_notes TEXT,
    created_by TEXT NOT NULL,
    resolved_by TEXT,
    created_at INTEGER NOT NULL,
    resolved_at INTEGER
)
            "#,
            r#"
DROP TABLE disputes
            "#,
        ),
        Migration::new(
            7,
            "merge_coordination",
            r#"
CREATE TABLE merge_locks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    runner_id TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    heartbeat_at INTEGER
);
CREATE TABLE merge_progress (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    workstream_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    commit_sha TEXT,
    status TEXT NOT NULL CHECK (status IN ('applied', 'conflict', 'skipped')),
    conflict_task_id TEXT,
    created_at INTEGER NOT NULL,
    applied_at INTEGER
)
            "#,
            r#"
DROP TABLE merge_progress;
DROP TABLE merge_locks
            "#,
        ),
        Migration::new(
            8,
            "failure_tracking",
            r#"
ALTER TABLE tasks ADD COLUMN failure_count INTEGER NOT NULL DEFAULT 0;
ALTER TABLE tasks ADD COLUMN last_failure_at INTEGER;
CREATE INDEX idx_tasks_failure_count ON tasks(failure_count)
            "#,
            r#"
DROP INDEX idx_tasks_failure_count;
ALTER TABLE tasks DROP COLUMN last_failure_at;
ALTER TABLE tasks DROP COLUMN failure_count
            "#,
        ),
    ]
}

pub fn bundled_global_migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            "runner_registry",
            r#"
CREATE TABLE runners (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    pid INTEGER NOT NULL,
    project_path TEXT NOT NULL,
    current_task_id TEXT,
    section_id TEXT,
    parallel_session_id TEXT,
    started_at INTEGER NOT NULL,
    heartbeat_at INTEGER NOT NULL
);
CREATE INDEX idx_runners_project_path ON runners(project_path);
CREATE TABLE runner_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    runner_id TEXT NOT NULL,
    acquired_at INTEGER NOT NULL
);
CREATE TABLE projects (
    path TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    registered_at INTEGER NOT NULL,
    last_seen_at INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1,
    stats_total_tasks INTEGER NOT NULL DEFAULT 0,
    stats_completed_tasks INTEGER NOT NULL DEFAULT 0,
    stats_updated_at INTEGER
)
            "#,
            r#"
DROP TABLE projects;
DROP TABLE runner_lock;
DROP TABLE runners
            "#,
        ),
        Migration::new(
            2,
            "parallel_sessions",
            r#"
CREATE TABLE parallel_sessions (
    id TEXT PRIMARY KEY,
    project_path TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN (
        'running', 'merging', 'completed', 'failed',
        'blocked_validation', 'blocked_recovery', 'aborted'
    )),
    created_at INTEGER NOT NULL,
    completed_at INTEGER
);
CREATE TABLE workstreams (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES parallel_sessions(id),
    branch_name TEXT NOT NULL,
    section_ids TEXT NOT NULL,
    clone_path TEXT,
    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed', 'aborted')),
    runner_id TEXT,
    lease_expires_at INTEGER,
    recovery_attempts INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER,
    last_reconcile_action TEXT,
    last_reconciled_at INTEGER,
    completed_at INTEGER,
    created_at INTEGER NOT NULL
)
            "#,
            r#"
DROP TABLE workstreams;
DROP TABLE parallel_sessions
            "#,
        ),
        Migration::new(
            3,
            "activity_log",
            r#"
CREATE TABLE activity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_path TEXT NOT NULL,
    runner_id TEXT,
    task_id TEXT,
    task_title TEXT,
    section_name TEXT,
    final_status TEXT,
    commit_message TEXT,
    commit_sha TEXT,
    created_at INTEGER NOT NULL
)
            "#,
            r#"
DROP TABLE activity_log
            "#,
        ),
    ]
}
