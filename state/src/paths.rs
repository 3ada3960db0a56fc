use std::path::Path;
use std::path::PathBuf;

/// File name of both the project-local and the global database.
pub const PROJECT_DB_FILENAME: &str = "steroids.db";

const STEROIDS_DIR: &str = ".steroids";
const HOME_ENV_VAR: &str = "STEROIDS_HOME";

/// Filesystem layout of a project's `.steroids/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteroidsPaths {
    root: PathBuf,
}

impl SteroidsPaths {
    pub fn for_project(project_root: &Path) -> Self {
        Self {
            root: project_root.join(STEROIDS_DIR),
        }
    }

    pub fn steroids_dir(&self) -> &Path {
        self.root.as_path()
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(PROJECT_DB_FILENAME)
    }

    /// One JSONL transcript per invocation id.
    pub fn invocation_log_path(&self, invocation_id: i64) -> PathBuf {
        self.root.join("invocations").join(format!("{invocation_id}.log"))
    }

    pub fn invocations_dir(&self) -> PathBuf {
        self.root.join("invocations")
    }

    /// Daily textual runner logs, one directory per day.
    pub fn logs_dir_for_day(&self, day: &str) -> PathBuf {
        self.root.join("logs").join(day)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Timestamped snapshot directories written before migrations.
    pub fn backup_dir(&self, stamp: &str) -> PathBuf {
        self.root.join("backup").join(stamp)
    }

    /// Scratch space swept on runner start.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

/// Location of the global store shared by all projects for one user.
///
/// `$STEROIDS_HOME` wins when set; otherwise the invoking user's home
/// directory is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteroidsHome {
    root: PathBuf,
}

impl SteroidsHome {
    pub fn resolve() -> anyhow::Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV_VAR) {
            return Ok(Self {
                root: PathBuf::from(home),
            });
        }
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine a home directory; set {HOME_ENV_VAR}"))?;
        Ok(Self { root: home })
    }

    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn steroids_dir(&self) -> PathBuf {
        self.root.join(STEROIDS_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.steroids_dir().join(PROJECT_DB_FILENAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.steroids_dir().join("config.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_paths_nest_under_steroids_dir() {
        let paths = SteroidsPaths::for_project(Path::new("/work/proj"));
        assert_eq!(paths.db_path(), PathBuf::from("/work/proj/.steroids/steroids.db"));
        assert_eq!(
            paths.invocation_log_path(42),
            PathBuf::from("/work/proj/.steroids/invocations/42.log")
        );
        assert_eq!(
            paths.backup_dir("2026-08-01T12-00-00"),
            PathBuf::from("/work/proj/.steroids/backup/2026-08-01T12-00-00")
        );
    }

    #[test]
    fn home_honors_override_root() {
        let home = SteroidsHome::at(PathBuf::from("/custom/home"));
        assert_eq!(home.db_path(), PathBuf::from("/custom/home/.steroids/steroids.db"));
    }
}
