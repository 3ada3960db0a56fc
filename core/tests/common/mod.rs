use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use steroids_core::config::SlotConfig;
use steroids_state::GlobalStore;
use steroids_state::OpenOptions;
use steroids_state::ProjectStore;
use steroids_state::SteroidsHome;
use steroids_state::Task;
use steroids_state::TaskCreateParams;

pub struct TestEnv {
    pub project_dir: tempfile::TempDir,
    pub home_dir: tempfile::TempDir,
    pub store: ProjectStore,
    pub global: GlobalStore,
    pub home: SteroidsHome,
}

impl TestEnv {
    pub fn project_root(&self) -> &Path {
        self.project_dir.path()
    }

    pub fn project_path(&self) -> String {
        self.project_dir.path().display().to_string()
    }
}

pub async fn test_env() -> TestEnv {
    let project_dir = tempfile::tempdir().expect("project dir");
    let home_dir = tempfile::tempdir().expect("home dir");
    let home = SteroidsHome::at(home_dir.path().to_path_buf());
    let store = ProjectStore::open(project_dir.path(), &OpenOptions::default())
        .await
        .expect("open project store");
    let global = GlobalStore::open(home.clone(), &OpenOptions::default())
        .await
        .expect("open global store");
    TestEnv {
        project_dir,
        home_dir,
        store,
        global,
        home,
    }
}

pub async fn seed_task(store: &ProjectStore, id: &str) -> Task {
    store
        .create_task(&TaskCreateParams {
            id: id.to_string(),
            title: format!("task {id}"),
            ..Default::default()
        })
        .await
        .expect("create task")
}

/// Drop an executable stand-in for a provider CLI into the project dir.
pub async fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, format!("#!/bin/sh\n{body}\n"))
        .await
        .expect("write script");
    let mut permissions = std::fs::metadata(&path).expect("stat script").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod script");
    path
}

/// A provider slot routed through a script via the template mechanism; the
/// script receives the prompt path as its first argument.
pub fn scripted_slot(script: &Path) -> SlotConfig {
    SlotConfig {
        provider: "claude".to_string(),
        model: "test-model".to_string(),
        cli: Some(format!("{} {{prompt}}", script.display())),
    }
}
