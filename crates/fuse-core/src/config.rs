//! fusegrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::types::DesiredSetup;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub server: ServerConfig,
    pub platform: PlatformConfig,
    pub build: BuildConfig,
    pub optimizer: OptimizerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the REST API binds to.
    pub listen: String,
    /// Address deployed groups use to reach the read endpoint.
    /// Sent to every group in the `Fusionizer-Server-Address` header.
    pub public_address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            public_address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    /// Nuclio, driven through the `nuctl` CLI.
    #[default]
    Nuctl,
    /// In-process platform, for local runs.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub kind: PlatformKind,
    pub namespace: Option<String>,
    pub registry: Option<String>,
    pub run_registry: Option<String>,
    pub kubeconfig: Option<String>,
    /// Nuclio platform flag: `auto`, `local` or `kube`.
    pub platform: String,
    pub invoke_timeout_secs: u64,
    /// Upper bound for one `nuctl` command, deploys included.
    pub command_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            kind: PlatformKind::Nuctl,
            namespace: Some("nuclio".to_string()),
            registry: None,
            run_registry: None,
            kubeconfig: None,
            platform: "auto".to_string(),
            invoke_timeout_secs: 30,
            command_timeout_secs: 600,
        }
    }
}

/// How conflicting numeric resource fields are combined when fusing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Keep the largest request/limit of any member.
    #[default]
    Max,
    /// Add up the members' requests/limits.
    Sum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Where fused bundles are written, one directory per group key.
    pub work_dir: PathBuf,
    /// Where uploaded task bundles live, one directory per task.
    pub tasks_dir: PathBuf,
    pub merge_policy: MergePolicy,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("build"),
            tasks_dir: PathBuf::from("tasks"),
            merge_policy: MergePolicy::Max,
        }
    }
}

/// Optimizer strategy selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum OptimizerConfig {
    /// No optimizer: groups only change through the API.
    #[default]
    None,
    /// A time-indexed schedule of partitions.
    Static(StaticScheduleConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticScheduleConfig {
    pub schedule: Vec<ScheduleEntry>,
    /// JSON file holding a list of partitions, applied one per `interval_secs`.
    pub schedule_file: Option<PathBuf>,
    pub interval_secs: u64,
    /// Restart the schedule after this many seconds.
    pub period_secs: Option<u64>,
    /// Poll interval once the schedule is exhausted.
    pub idle_secs: u64,
}

impl Default for StaticScheduleConfig {
    fn default() -> Self {
        Self {
            schedule: Vec::new(),
            schedule_file: None,
            interval_secs: 60,
            period_secs: None,
            idle_secs: 30,
        }
    }
}

/// One scheduled partition, activated `at_secs` after the optimizer starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub at_secs: u64,
    pub groups: DesiredSetup,
}

impl StaticScheduleConfig {
    /// Inline entries plus the entries of `schedule_file`, sorted by time.
    pub fn entries(&self) -> Result<Vec<ScheduleEntry>, CoreError> {
        let mut entries = self.schedule.clone();
        if let Some(path) = &self.schedule_file {
            let content = std::fs::read_to_string(path)?;
            let partitions: Vec<DesiredSetup> = serde_json::from_str(&content)?;
            entries.extend(partitions.into_iter().enumerate().map(|(i, groups)| {
                ScheduleEntry {
                    at_secs: i as u64 * self.interval_secs,
                    groups,
                }
            }));
        }
        entries.sort_by_key(|e| e.at_secs);
        Ok(entries)
    }
}

impl FusionConfig {
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: FusionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config: FusionConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8000");
        assert_eq!(config.platform.kind, PlatformKind::Nuctl);
        assert_eq!(config.platform.namespace.as_deref(), Some("nuclio"));
        assert_eq!(config.build.merge_policy, MergePolicy::Max);
        assert!(matches!(config.optimizer, OptimizerConfig::None));
    }

    #[test]
    fn test_parse_static_schedule() {
        let toml_str = r#"
[platform]
kind = "memory"

[build]
work_dir = "/tmp/fusegrid/build"
merge_policy = "sum"

[optimizer]
strategy = "static"
idle_secs = 10

[[optimizer.schedule]]
at_secs = 0
groups = [["taska"], ["taskb"]]

[[optimizer.schedule]]
at_secs = 30
groups = [["TaskA", "taskb"]]
"#;
        let config: FusionConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.platform.kind, PlatformKind::Memory);
        assert_eq!(config.build.merge_policy, MergePolicy::Sum);

        let OptimizerConfig::Static(schedule) = config.optimizer else {
            panic!("expected static optimizer");
        };
        assert_eq!(schedule.idle_secs, 10);
        let entries = schedule.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].at_secs, 30);
        assert_eq!(entries[1].groups.groups()[0].len(), 2);
    }

    #[test]
    fn test_schedule_file_entries_are_spaced_by_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"[[["taska"], ["taskb"]], [["taska", "taskb"]]]"#).unwrap();

        let schedule = StaticScheduleConfig {
            schedule_file: Some(path),
            interval_secs: 5,
            ..Default::default()
        };
        let entries = schedule.entries().unwrap();
        assert_eq!(
            entries.iter().map(|e| e.at_secs).collect::<Vec<_>>(),
            vec![0, 5]
        );
    }

    #[test]
    fn test_invalid_task_name_in_schedule_fails() {
        let toml_str = r#"
[optimizer]
strategy = "static"

[[optimizer.schedule]]
at_secs = 0
groups = [["not_valid"]]
"#;
        assert!(toml::from_str::<FusionConfig>(toml_str).is_err());
    }
}
