use serde::Deserialize;
use serde::Serialize;
use serde::de;
use std::fmt;
use std::time::Duration;

use steroids_state::InvocationRole;

/// A duration that deserializes from either a bare number (milliseconds) or
/// a suffixed string (`500ms`, `30s`, `5m`, `1h`, `2d`, `1w`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl DurationValue {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn as_secs(self) -> u64 {
        self.0.as_secs()
    }
}

pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        anyhow::bail!("empty duration");
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        // Bare numbers are milliseconds.
        return Ok(Duration::from_millis(raw.parse()?));
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| anyhow::anyhow!("invalid duration: {raw}"))?;
    let (value, suffix) = raw.split_at(split);
    let value: f64 = value.parse()?;
    let multiplier_ms = match suffix.trim() {
        "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        "w" => 604_800_000.0,
        other => anyhow::bail!("unknown duration suffix `{other}` in {raw}"),
    };
    Ok(Duration::from_millis((value * multiplier_ms) as u64))
}

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = DurationValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string (e.g. `30s`) or milliseconds")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(DurationValue(Duration::from_millis(value)))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u64::try_from(value)
                    .map(|ms| DurationValue(Duration::from_millis(ms)))
                    .map_err(|_| E::custom("negative duration"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                parse_duration(value)
                    .map(DurationValue)
                    .map_err(|err| E::custom(err.to_string()))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

impl Serialize for DurationValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let secs = self.0.as_secs_f64();
        if secs.fract() == 0.0 {
            serializer.serialize_str(&format!("{}s", secs as u64))
        } else {
            serializer.serialize_str(&format!("{}ms", self.0.as_millis()))
        }
    }
}

/// One configured provider slot (coder, reviewer, or orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlotConfig {
    pub provider: String,
    pub model: String,
    /// Optional custom invocation template; `{prompt}` and `{model}` expand.
    pub cli: Option<String>,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            provider: "claude".to_string(),
            model: String::new(),
            cli: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AiConfig {
    pub orchestrator: SlotConfig,
    pub coder: SlotConfig,
    pub reviewer: SlotConfig,
}

impl AiConfig {
    pub fn slot(&self, role: InvocationRole) -> &SlotConfig {
        match role {
            InvocationRole::Coder => &self.coder,
            InvocationRole::Reviewer => &self.reviewer,
            InvocationRole::Orchestrator => &self.orchestrator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnersConfig {
    pub heartbeat_interval: DurationValue,
    pub stale_timeout: DurationValue,
    pub subprocess_hang_timeout: DurationValue,
    pub max_concurrent: u32,
}

impl Default for RunnersConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DurationValue::from_secs(30),
            stale_timeout: DurationValue::from_secs(300),
            subprocess_hang_timeout: DurationValue::from_secs(300),
            max_concurrent: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    pub orphaned_task_timeout: DurationValue,
    pub max_coder_duration: DurationValue,
    pub max_reviewer_duration: DurationValue,
    pub runner_heartbeat_timeout: DurationValue,
    pub invocation_staleness: DurationValue,
    pub auto_recover: bool,
    pub max_recovery_attempts: i64,
    pub max_incidents_per_hour: i64,
    pub sanitise_enabled: bool,
    pub sanitise_interval_minutes: u64,
    pub sanitise_invocation_timeout_sec: u64,
    pub db_inconsistency_recent_update_sec: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            orphaned_task_timeout: DurationValue::from_secs(600),
            max_coder_duration: DurationValue::from_secs(1800),
            max_reviewer_duration: DurationValue::from_secs(900),
            runner_heartbeat_timeout: DurationValue::from_secs(300),
            invocation_staleness: DurationValue::from_secs(600),
            auto_recover: true,
            max_recovery_attempts: 3,
            max_incidents_per_hour: 10,
            sanitise_enabled: true,
            sanitise_interval_minutes: 5,
            sanitise_invocation_timeout_sec: 1800,
            db_inconsistency_recent_update_sec: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockingConfig {
    pub task_timeout: DurationValue,
    pub section_timeout: DurationValue,
    pub wait_timeout: DurationValue,
    pub poll_interval: DurationValue,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            task_timeout: DurationValue::from_secs(3600),
            section_timeout: DurationValue::from_secs(1800),
            wait_timeout: DurationValue::from_secs(1800),
            poll_interval: DurationValue::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub auto_migrate: bool,
    pub backup_before_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            auto_migrate: true,
            backup_before_migrate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisputesConfig {
    pub timeout_days: u64,
    pub auto_create_on_max_rejections: bool,
    pub major_blocks_loop: bool,
}

impl Default for DisputesConfig {
    fn default() -> Self {
        Self {
            timeout_days: 3,
            auto_create_on_max_rejections: true,
            major_blocks_loop: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SectionsConfig {
    pub batch_mode: bool,
    pub max_batch_size: usize,
}

impl Default for SectionsConfig {
    fn default() -> Self {
        Self {
            batch_mode: false,
            max_batch_size: 5,
        }
    }
}

/// Fully merged runtime configuration:
/// defaults < global file < per-project file < `STEROIDS_*` environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub ai: AiConfig,
    pub runners: RunnersConfig,
    pub health: HealthConfig,
    pub locking: LockingConfig,
    pub database: DatabaseConfig,
    pub disputes: DisputesConfig,
    pub sections: SectionsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn duration_suffixes_parse() {
        assert_eq!(parse_duration("500ms").expect("ms"), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").expect("s"), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").expect("m"), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").expect("h"), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").expect("d"), Duration::from_secs(86400));
        assert_eq!(parse_duration("1w").expect("w"), Duration::from_secs(604800));
        // Bare numbers are milliseconds.
        assert_eq!(parse_duration("1500").expect("bare"), Duration::from_millis(1500));
        assert!(parse_duration("10 fortnights").is_err());
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.runners.heartbeat_interval.as_secs(), 30);
        assert_eq!(config.health.orphaned_task_timeout.as_secs(), 600);
        assert_eq!(config.health.max_coder_duration.as_secs(), 1800);
        assert_eq!(config.health.max_reviewer_duration.as_secs(), 900);
        assert_eq!(config.health.runner_heartbeat_timeout.as_secs(), 300);
        assert_eq!(config.health.max_recovery_attempts, 3);
        assert_eq!(config.health.max_incidents_per_hour, 10);
        assert_eq!(config.locking.task_timeout.as_secs(), 3600);
        assert_eq!(config.locking.wait_timeout.as_secs(), 1800);
        assert!(config.database.auto_migrate);
        assert!(!config.sections.batch_mode);
    }

    #[test]
    fn yaml_round_trips_camel_case_keys() {
        let yaml = r#"
health:
  orphanedTaskTimeout: 120s
  maxIncidentsPerHour: 4
locking:
  taskTimeout: 10m
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.health.orphaned_task_timeout.as_secs(), 120);
        assert_eq!(config.health.max_incidents_per_hour, 4);
        assert_eq!(config.locking.task_timeout.as_secs(), 600);
        // Untouched sections keep their defaults.
        assert_eq!(config.runners.heartbeat_interval.as_secs(), 30);
    }
}
