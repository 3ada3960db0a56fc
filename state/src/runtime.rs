use chrono::Utc;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::migrations;
use crate::migrations::BackupSpec;
use crate::migrations::StoreKind;
use crate::paths::SteroidsHome;
use crate::paths::SteroidsPaths;

mod disputes;
mod incidents;
mod invocations;
mod locks;
mod runners;
mod sections;
mod tasks;
#[cfg(test)]
mod test_support;
mod workstreams;

pub use crate::migrations::schema_ddl;
pub use incidents::credit_incident_details;

const BACKUP_STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// How a store should be brought up on open.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub auto_migrate: bool,
    pub backup_before_migrate: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            auto_migrate: true,
            backup_before_migrate: false,
        }
    }
}

/// Handle on one project's `.steroids/steroids.db`.
#[derive(Clone, Debug)]
pub struct ProjectStore {
    paths: SteroidsPaths,
    pool: Arc<SqlitePool>,
}

impl ProjectStore {
    /// Open (creating if missing) the project-local store and bring it to the
    /// newest bundled schema.
    pub async fn open(project_root: &Path, options: &OpenOptions) -> anyhow::Result<Self> {
        let paths = SteroidsPaths::for_project(project_root);
        tokio::fs::create_dir_all(paths.steroids_dir()).await?;
        let db_path = paths.db_path();
        let pool = open_sqlite(&db_path).await?;
        let bundled = crate::bundled_project_migrations();
        if options.auto_migrate {
            let backup = options.backup_before_migrate.then(|| BackupSpec {
                db_path: db_path.clone(),
                backup_dir: paths.backup_dir(&Utc::now().format(BACKUP_STAMP_FORMAT).to_string()),
            });
            migrations::run_pending(&pool, StoreKind::Project, &bundled, backup.as_ref()).await?;
        } else {
            refuse_unmigrated(&pool, StoreKind::Project, &bundled).await?;
        }
        Ok(Self {
            paths,
            pool: Arc::new(pool),
        })
    }

    pub fn paths(&self) -> &SteroidsPaths {
        &self.paths
    }

    /// Direct pool access, for schema comparisons and focused tests.
    pub fn pool(&self) -> &SqlitePool {
        self.pool.as_ref()
    }

    pub async fn schema_version(&self) -> anyhow::Result<i64> {
        Ok(migrations::applied_version(&self.pool).await?)
    }

    /// Roll back to `target` (0 reverts everything). The typed error keeps
    /// `ChecksumMismatch`/`SchemaAhead` distinguishable for callers.
    pub async fn migrate_down(&self, target: i64) -> Result<usize, crate::MigrationError> {
        let bundled = crate::bundled_project_migrations();
        migrations::run_down(&self.pool, StoreKind::Project, &bundled, target).await
    }

    /// Re-run any pending migrations, for stores opened with
    /// `auto_migrate=false` or rolled back in place.
    pub async fn migrate_up(&self) -> Result<usize, crate::MigrationError> {
        let bundled = crate::bundled_project_migrations();
        migrations::run_pending(&self.pool, StoreKind::Project, &bundled, None).await
    }

    pub async fn get_meta(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM _schema WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.map(|row| row.try_get("value")).transpose().map_err(Into::into)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO _schema (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}

/// Handle on the per-user global store shared by all projects.
#[derive(Clone)]
pub struct GlobalStore {
    home: SteroidsHome,
    pool: Arc<SqlitePool>,
}

impl GlobalStore {
    pub async fn open(home: SteroidsHome, options: &OpenOptions) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(home.steroids_dir()).await?;
        let db_path = home.db_path();
        let pool = open_sqlite(&db_path).await?;
        let bundled = crate::bundled_global_migrations();
        if options.auto_migrate {
            migrations::run_pending(&pool, StoreKind::Global, &bundled, None).await?;
        } else {
            refuse_unmigrated(&pool, StoreKind::Global, &bundled).await?;
        }
        Ok(Self {
            home,
            pool: Arc::new(pool),
        })
    }

    pub fn home(&self) -> &SteroidsHome {
        &self.home
    }

    pub fn pool(&self) -> &SqlitePool {
        self.pool.as_ref()
    }

    pub async fn schema_version(&self) -> anyhow::Result<i64> {
        Ok(migrations::applied_version(&self.pool).await?)
    }
}

async fn refuse_unmigrated(
    pool: &SqlitePool,
    kind: StoreKind,
    bundled: &[crate::Migration],
) -> anyhow::Result<()> {
    migrations::ensure_meta_tables(pool, kind).await?;
    let version = migrations::applied_version(pool).await?;
    let newest = bundled.last().map(|m| m.id).unwrap_or(0);
    if version > newest {
        return Err(crate::MigrationError::SchemaAhead {
            found: version,
            bundled: newest,
        }
        .into());
    }
    if version < newest {
        tracing::warn!(
            version,
            newest,
            "store schema is behind the bundled set; run `steroids migrate` \
             or enable database.autoMigrate"
        );
    }
    Ok(())
}

async fn open_sqlite(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .log_statements(LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub(crate) fn now_seconds() -> i64 {
    Utc::now().timestamp()
}
