use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use storage_planner_core::{Bootloader, PlannerConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_settle_max_attempts")]
    pub settle_max_attempts: u32,
    #[serde(default = "default_change_poll_interval_ms")]
    pub change_poll_interval_ms: u64,
    #[serde(default = "default_change_timeout_ms")]
    pub change_timeout_ms: u64,
    #[serde(default = "default_use_os_prober")]
    pub use_os_prober: bool,
    /// Skips firmware detection when set.
    #[serde(default)]
    pub bootloader: Option<Bootloader>,
}

fn default_probe_timeout_ms() -> u64 {
    15_000
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_settle_max_attempts() -> u32 {
    50
}

fn default_change_poll_interval_ms() -> u64 {
    100
}

fn default_change_timeout_ms() -> u64 {
    600_000
}

fn default_use_os_prober() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            planner: PlannerConfig::default(),
            probe_timeout_ms: default_probe_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            settle_max_attempts: default_settle_max_attempts(),
            change_poll_interval_ms: default_change_poll_interval_ms(),
            change_timeout_ms: default_change_timeout_ms(),
            use_os_prober: default_use_os_prober(),
            bootloader: None,
        }
    }
}

impl ServiceConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn change_poll_interval(&self) -> Duration {
        Duration::from_millis(self.change_poll_interval_ms)
    }

    pub fn change_timeout(&self) -> Duration {
        Duration::from_millis(self.change_timeout_ms)
    }

    pub fn bootloader(&self) -> Bootloader {
        self.bootloader
            .unwrap_or_else(storage_planner_core::platform::detect_bootloader)
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<ServiceConfig> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: ServiceConfig = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use storage_planner_core::{Bootloader, SizingPolicy};

    use super::{load_config, ServiceConfig};

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"bootloader": "bios", "planner": {"sizing_policy": "all"}}"#,
        )
        .expect("write config");
        let config = load_config(&path).expect("loads");
        assert_eq!(config.bootloader(), Bootloader::Bios);
        assert_eq!(config.planner.sizing_policy, SizingPolicy::All);
        assert_eq!(config.probe_timeout_ms, ServiceConfig::default().probe_timeout_ms);
        assert!(config.use_os_prober);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_config("/nonexistent/storage.json").expect_err("missing");
        assert!(err.to_string().contains("/nonexistent/storage.json"));
    }
}
