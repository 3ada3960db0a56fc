//! Layered YAML configuration.
//!
//! Configuration is built up from multiple layers in the following order,
//! later layers overriding earlier ones key-by-key:
//!
//! - defaults: [`Config::default`]
//! - global:   `$STEROIDS_HOME/.steroids/config.yaml`
//! - project:  `<project>/.steroids/config.yaml`
//! - env:      `STEROIDS_*` variables

mod types;

pub use types::AiConfig;
pub use types::Config;
pub use types::DatabaseConfig;
pub use types::DisputesConfig;
pub use types::DurationValue;
pub use types::HealthConfig;
pub use types::LockingConfig;
pub use types::RunnersConfig;
pub use types::SectionsConfig;
pub use types::SlotConfig;
pub use types::parse_duration;

use serde_yaml::Value;
use std::path::Path;
use std::path::PathBuf;
use steroids_state::SteroidsHome;
use steroids_state::SteroidsPaths;
use tracing::debug;

pub const ENV_PREFIX: &str = "STEROIDS_";
pub const CONFIG_FILE_NAME: &str = "config.yaml";

pub fn project_config_path(project_root: &Path) -> PathBuf {
    SteroidsPaths::for_project(project_root)
        .steroids_dir()
        .join(CONFIG_FILE_NAME)
}

/// Load and merge every configuration layer for a project.
pub async fn load_config(project_root: &Path, home: &SteroidsHome) -> anyhow::Result<Config> {
    load_config_with_env(project_root, home, std::env::vars().collect::<Vec<_>>().into_iter()).await
}

pub async fn load_config_with_env(
    project_root: &Path,
    home: &SteroidsHome,
    vars: impl Iterator<Item = (String, String)>,
) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::to_value(Config::default())?;
    for path in [home.config_path(), project_config_path(project_root)] {
        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        let overlay: Value = serde_yaml::from_str(&text)?;
        debug!("merging config layer {}", path.display());
        merge_yaml_values(&mut merged, overlay);
    }
    apply_env_overrides(&mut merged, vars);
    Ok(serde_yaml::from_value(merged)?)
}

/// Deep-merge `overlay` into `base`: mappings recurse, anything else wins
/// wholesale.
pub fn merge_yaml_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// `STEROIDS_<SEGMENT1>_<SEGMENT2>_…` sets `segment1.segment2…`. Segments
/// match existing keys case-insensitively so `STEROIDS_HEALTH_AUTORECOVER`
/// lands on `health.autoRecover`.
pub fn apply_env_overrides(
    value: &mut Value,
    vars: impl Iterator<Item = (String, String)>,
) {
    for (name, raw) in vars {
        let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let segments: Vec<String> = rest.split('_').map(str::to_lowercase).collect();
        set_path_case_insensitive(value, &segments, coerce_env_value(&raw));
    }
}

/// `true`/`false` become booleans, all-digit strings become numbers,
/// everything else stays a string.
pub fn coerce_env_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) => raw
            .parse::<u64>()
            .map(Into::into)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        _ => Value::String(raw.to_string()),
    }
}

fn set_path_case_insensitive(value: &mut Value, segments: &[String], new_value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *value = new_value;
        return;
    };
    if !value.is_mapping() {
        *value = Value::Mapping(serde_yaml::Mapping::new());
    }
    let Some(map) = value.as_mapping_mut() else {
        return;
    };
    let canonical = map
        .keys()
        .filter_map(Value::as_str)
        .find(|key| key.to_lowercase() == *head)
        .map(str::to_string)
        .unwrap_or_else(|| head.clone());
    let key = Value::String(canonical);
    let entry = map.entry(key).or_insert(Value::Null);
    set_path_case_insensitive(entry, rest, new_value);
}

/// Read `a.b.c` out of a YAML document.
pub fn get_config_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Write `a.b.c`, creating intermediate mappings as needed.
pub fn set_config_value(value: &mut Value, path: &str, new_value: Value) {
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    set_path_exact(value, &segments, new_value);
}

fn set_path_exact(value: &mut Value, segments: &[String], new_value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *value = new_value;
        return;
    };
    if !value.is_mapping() {
        *value = Value::Mapping(serde_yaml::Mapping::new());
    }
    let Some(map) = value.as_mapping_mut() else {
        return;
    };
    let key = Value::String(head.clone());
    let entry = map.entry(key).or_insert(Value::Null);
    set_path_exact(entry, rest, new_value);
}

/// Set one dotted key in a config file, creating the file if missing.
pub async fn set_config_file_value(
    path: &Path,
    dotted: &str,
    new_value: Value,
) -> anyhow::Result<()> {
    let mut document = match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_yaml::from_str(&text)?,
        Err(_) => Value::Mapping(serde_yaml::Mapping::new()),
    };
    set_config_value(&mut document, dotted, new_value);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_yaml::to_string(&document)?).await?;
    Ok(())
}

pub async fn get_config_file_value(path: &Path, dotted: &str) -> anyhow::Result<Option<Value>> {
    let Ok(text) = tokio::fs::read_to_string(path).await else {
        return Ok(None);
    };
    let document: Value = serde_yaml::from_str(&text)?;
    Ok(get_config_value(&document, dotted).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn overlay_wins_key_by_key() {
        let mut base: Value = serde_yaml::from_str("a: 1\nb:\n  c: 2\n  d: 3").expect("base");
        let overlay: Value = serde_yaml::from_str("b:\n  c: 9").expect("overlay");
        merge_yaml_values(&mut base, overlay);
        assert_eq!(get_config_value(&base, "a").and_then(Value::as_u64), Some(1));
        assert_eq!(get_config_value(&base, "b.c").and_then(Value::as_u64), Some(9));
        assert_eq!(get_config_value(&base, "b.d").and_then(Value::as_u64), Some(3));
    }

    #[test]
    fn env_values_coerce_by_shape() {
        assert_eq!(coerce_env_value("true"), Value::Bool(true));
        assert_eq!(coerce_env_value("false"), Value::Bool(false));
        assert_eq!(coerce_env_value("42"), Value::from(42u64));
        assert_eq!(coerce_env_value("30s"), Value::String("30s".to_string()));
    }

    #[test]
    fn env_overrides_land_on_camel_case_keys() {
        let mut value = serde_yaml::to_value(Config::default()).expect("defaults");
        apply_env_overrides(
            &mut value,
            [
                ("STEROIDS_AI_CODER_PROVIDER".to_string(), "codex".to_string()),
                ("STEROIDS_HEALTH_AUTORECOVER".to_string(), "false".to_string()),
                ("STEROIDS_HEALTH_MAXINCIDENTSPERHOUR".to_string(), "3".to_string()),
                ("UNRELATED".to_string(), "ignored".to_string()),
            ]
            .into_iter(),
        );
        let config: Config = serde_yaml::from_value(value).expect("typed");
        assert_eq!(config.ai.coder.provider, "codex");
        assert!(!config.health.auto_recover);
        assert_eq!(config.health.max_incidents_per_hour, 3);
    }

    #[test]
    fn set_then_get_round_trips_any_path() {
        let mut document = Value::Mapping(serde_yaml::Mapping::new());
        set_config_value(&mut document, "ai.reviewer.model", Value::String("o3".into()));
        set_config_value(&mut document, "sections.maxBatchSize", Value::from(7u64));
        assert_eq!(
            get_config_value(&document, "ai.reviewer.model").and_then(Value::as_str),
            Some("o3")
        );
        assert_eq!(
            get_config_value(&document, "sections.maxBatchSize").and_then(Value::as_u64),
            Some(7)
        );
        assert_eq!(get_config_value(&document, "missing.path"), None);
    }

    #[tokio::test]
    async fn project_layer_overrides_global_layer() {
        let home_dir = tempfile::tempdir().expect("home");
        let project_dir = tempfile::tempdir().expect("project");
        let home = SteroidsHome::at(home_dir.path().to_path_buf());

        tokio::fs::create_dir_all(home.steroids_dir()).await.expect("mkdir");
        tokio::fs::write(home.config_path(), "ai:\n  coder:\n    provider: gemini\n    model: g-1\n")
            .await
            .expect("global config");

        let project_config = project_config_path(project_dir.path());
        tokio::fs::create_dir_all(project_config.parent().expect("parent"))
            .await
            .expect("mkdir");
        tokio::fs::write(&project_config, "ai:\n  coder:\n    model: g-2\n")
            .await
            .expect("project config");

        let config = load_config_with_env(project_dir.path(), &home, std::iter::empty())
            .await
            .expect("load");
        assert_eq!(config.ai.coder.provider, "gemini");
        assert_eq!(config.ai.coder.model, "g-2");
    }
}
