//! Service configuration
//!
//! Read once at startup from a TOML file (`CDSERVICE_CONFIG`, default
//! `./cdservice.toml`) with a handful of environment overrides, then passed
//! explicitly to the engine factory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::algorithms::{AlgorithmDescriptor, AlgorithmSet};
use crate::error::ConfigError;
use crate::runner::RunnerSettings;

pub const CONFIG_ENV: &str = "CDSERVICE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "./cdservice.toml";

pub const TASK_DIR_ENV: &str = "CDSERVICE_TASK_DIR";
pub const NUM_WORKERS_ENV: &str = "CDSERVICE_NUM_WORKERS";
pub const DOCKER_CMD_ENV: &str = "CDSERVICE_DOCKER_CMD";
pub const BIND_ADDRESS_ENV: &str = "CDSERVICE_BIND_ADDRESS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root of the per-task working directories
    pub task_dir: PathBuf,
    pub num_workers: usize,
    /// Container runtime binary
    pub docker_cmd: String,
    pub algorithm_timeout_secs: u64,
    /// Suffix for the task directory volume mount; empty disables it
    pub mount_options: Option<String>,
    pub poll_interval_ms: u64,
    /// Cap on unsettled tasks held by the pool, 0 for none
    pub max_queued_tasks: usize,
    /// Public base URL used to build `Location` headers
    pub host_url: String,
    pub bind_address: String,
    pub app_path: String,
    pub name: String,
    pub description: String,
    pub input_data_format: String,
    pub output_data_format: String,
    /// Separate TOML or JSON algorithm set; takes precedence over `algorithms`
    pub algorithm_file: Option<PathBuf>,
    pub algorithms: BTreeMap<String, AlgorithmDescriptor>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            task_dir: PathBuf::from("/tmp"),
            num_workers: 1,
            docker_cmd: "docker".to_string(),
            algorithm_timeout_secs: 180,
            mount_options: Some(":ro".to_string()),
            poll_interval_ms: 10,
            max_queued_tasks: 0,
            host_url: String::new(),
            bind_address: "0.0.0.0:8081".to_string(),
            app_path: "/cd/communitydetection".to_string(),
            name: "Community Detection".to_string(),
            description: "Runs community detection algorithms packaged as containers".to_string(),
            input_data_format: "CX2".to_string(),
            output_data_format: "CX2".to_string(),
            algorithm_file: None,
            algorithms: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Parse a configuration document; missing keys take defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: ServiceConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            origin: "service configuration".to_string(),
            message: e.to_string(),
        })?;
        config.normalize();
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolve the configuration the way the binary does.
    ///
    /// An explicit `CDSERVICE_CONFIG` must exist; a missing default file
    /// falls back to built-in defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let explicit = std::env::var(CONFIG_ENV).ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));

        let mut config = match Self::load(&path) {
            Ok(config) => {
                info!("Loaded configuration from {}", path.display());
                config
            }
            Err(ConfigError::Missing(_)) if explicit.is_none() => {
                warn!(
                    "No configuration at {}, using defaults",
                    path.display()
                );
                Self::default()
            }
            Err(e) => return Err(e).context("Failed to load service configuration"),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `CDSERVICE_*` overrides from `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(TASK_DIR_ENV) {
            self.task_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup(NUM_WORKERS_ENV) {
            self.num_workers = workers.trim().parse().map_err(|e| ConfigError::Parse {
                origin: NUM_WORKERS_ENV.to_string(),
                message: format!("{}: {}", workers, e),
            })?;
        }
        if let Some(cmd) = lookup(DOCKER_CMD_ENV) {
            self.docker_cmd = cmd;
        }
        if let Some(addr) = lookup(BIND_ADDRESS_ENV) {
            self.bind_address = addr;
        }
        self.normalize();
        Ok(())
    }

    fn normalize(&mut self) {
        if !self.host_url.is_empty() && !self.host_url.ends_with('/') {
            self.host_url.push('/');
        }
        if self.mount_options.as_deref() == Some("") {
            self.mount_options = None;
        }
        if self.num_workers == 0 {
            self.num_workers = 1;
        }
    }

    /// Loaded algorithm set, or `None` when the service has none configured
    pub fn algorithms(&self) -> Result<Option<AlgorithmSet>, ConfigError> {
        if let Some(path) = &self.algorithm_file {
            return AlgorithmSet::load(path).map(Some);
        }
        if self.algorithms.is_empty() {
            return Ok(None);
        }
        Ok(Some(AlgorithmSet::from_map(self.algorithms.clone())))
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            task_dir: self.task_dir.clone(),
            docker_cmd: self.docker_cmd.clone(),
            mount_options: self.mount_options.clone(),
            timeout: Duration::from_secs(self.algorithm_timeout_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Commented example configuration
    pub fn example() -> String {
        r#"# Community detection service configuration
#
# Path is read from CDSERVICE_CONFIG (default ./cdservice.toml).
# CDSERVICE_TASK_DIR, CDSERVICE_NUM_WORKERS, CDSERVICE_DOCKER_CMD and
# CDSERVICE_BIND_ADDRESS override the matching keys.

# Each task gets a subdirectory named by its id
task_dir = "/tmp/tasks"

# Tasks run in parallel
num_workers = 1

# Container runtime binary
docker_cmd = "docker"

# Wall-clock limit per task
algorithm_timeout_secs = 180

# Appended to the task directory volume mount
mount_options = ":ro"

poll_interval_ms = 10

# Reject submissions once this many tasks are unsettled (0 = no limit)
max_queued_tasks = 0

host_url = "http://localhost:8081/cd/communitydetection"
bind_address = "0.0.0.0:8081"
app_path = "/cd/communitydetection"

name = "Community Detection"
description = "Runs community detection algorithms packaged as containers"
input_data_format = "CX2"
output_data_format = "CX2"

# Algorithms may also live in a separate TOML or JSON file:
# algorithm_file = "/etc/cdservice/algorithms.json"

[algorithms.louvain]
displayName = "Louvain"
description = "Runs louvain community detection algorithm"
version = "2.0.0"
dockerImage = "coleslawndex/cdlouvain:2.0.0"
inputDataFormat = "CX2"
outputDataFormat = "CX2"

[[algorithms.louvain.customParameters]]
name = "--directed"
displayName = "Generate directed graph"
description = "If set, generate directed graph"
type = "flag"

[[algorithms.louvain.customParameters]]
name = "--resolution_parameter"
displayName = "Resolution parameter"
description = "Parameter for resolution"
type = "value"
validationType = "number"
validationHelp = "Must be a positive number"
minValue = 0.0
defaultValue = "0.1"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::ParameterType;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_for_missing_keys() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.task_dir, PathBuf::from("/tmp"));
        assert_eq!(config.num_workers, 1);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.runner_settings().timeout, Duration::from_secs(180));
        assert!(config.algorithms().unwrap().is_none());
    }

    #[test]
    fn test_example_parses() {
        let config = ServiceConfig::from_toml_str(&ServiceConfig::example()).unwrap();
        assert_eq!(config.task_dir, PathBuf::from("/tmp/tasks"));
        assert_eq!(
            config.host_url,
            "http://localhost:8081/cd/communitydetection/"
        );

        let algorithms = config.algorithms().unwrap().unwrap();
        let louvain = algorithms.get("louvain").unwrap();
        assert_eq!(louvain.name, "louvain");
        assert_eq!(louvain.docker_image, "coleslawndex/cdlouvain:2.0.0");
        assert_eq!(
            louvain.custom_parameter("--directed").unwrap().param_type,
            ParameterType::Flag
        );
    }

    #[test]
    fn test_empty_mount_options_disable_suffix() {
        let config = ServiceConfig::from_toml_str(r#"mount_options = """#).unwrap();
        assert_eq!(config.runner_settings().mount_options, None);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (TASK_DIR_ENV, "/data/tasks"),
            (NUM_WORKERS_ENV, " 4 "),
            (DOCKER_CMD_ENV, "podman"),
        ]
        .into_iter()
        .collect();
        let mut config = ServiceConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.task_dir, PathBuf::from("/data/tasks"));
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.docker_cmd, "podman");
        assert_eq!(config.bind_address, "0.0.0.0:8081");
    }

    #[test]
    fn test_bad_worker_count() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == NUM_WORKERS_ENV).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_missing_and_invalid() {
        let err = ServiceConfig::load(Path::new("/nonexistent/cdservice.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cdservice.toml");
        fs::write(&path, "num_workers = \"two\"").unwrap();
        assert!(matches!(
            ServiceConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_algorithm_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("algorithms.json");
        fs::write(
            &path,
            r#"{"algorithms": {"infomap": {"dockerImage": "img:2"}}}"#,
        )
        .unwrap();
        let config = ServiceConfig::from_toml_str(&format!(
            "algorithm_file = {:?}\n[algorithms.louvain]\ndockerImage = \"img:1\"\n",
            path.to_string_lossy()
        ))
        .unwrap();

        let algorithms = config.algorithms().unwrap().unwrap();
        assert!(algorithms.get("infomap").is_some());
        assert!(algorithms.get("louvain").is_none());
    }
}
