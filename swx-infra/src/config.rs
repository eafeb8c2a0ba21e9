//! Process configuration: a JSON file, overridden by command-line flags.
//!
//! ```json
//! {
//!   "eal": { "program_name": "dummy", "memory_channels": 4, "core_mask": "3" },
//!   "threads": { "pipeline_quanta": 1000, "control_interval": 16, "idle_poll_us": 1000 },
//!   "heartbeat": { "thread_id": 1, "period_ms": 1000 },
//!   "stop_timeout_ms": 1000
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use swx_thread::ThreadConfig;
use swx_thread::api::rte::eal::EalBuilder;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// EAL section. Defaults to `dummy -n 4 -c 3`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EalSection {
    pub program_name: String,
    pub memory_channels: Option<u32>,
    pub core_mask: Option<String>,
    pub core_list: Option<String>,
    pub main_lcore: Option<u32>,
    /// Extra raw arguments appended after the options above.
    pub args: Vec<String>,
}

impl Default for EalSection {
    fn default() -> Self {
        Self {
            program_name: "dummy".to_string(),
            memory_channels: Some(4),
            core_mask: Some("3".to_string()),
            core_list: None,
            main_lcore: None,
            args: Vec::new(),
        }
    }
}

impl EalSection {
    pub fn builder(&self) -> EalBuilder {
        let mut builder = EalBuilder::new().program_name(&self.program_name);
        if let Some(n) = self.memory_channels {
            builder = builder.memory_channels(n);
        }
        if let Some(mask) = &self.core_mask {
            builder = builder.core_mask(mask);
        }
        if let Some(list) = &self.core_list {
            builder = builder.core_list(list);
        }
        if let Some(id) = self.main_lcore {
            builder = builder.main_lcore(id);
        }
        for arg in &self.args {
            builder = builder.arg(arg);
        }
        builder
    }
}

/// Periodic liveness log run as a block on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    /// Worker to run on; no heartbeat when absent.
    pub thread_id: Option<u32>,
    pub period_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            thread_id: None,
            period_ms: 1000,
        }
    }
}

impl HeartbeatSection {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub eal: EalSection,
    pub threads: ThreadConfig,
    pub heartbeat: HeartbeatSection,
    /// How long teardown waits for running workers to stop.
    pub stop_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eal: EalSection::default(),
            threads: ThreadConfig::default(),
            heartbeat: HeartbeatSection::default(),
            stop_timeout_ms: 1000,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// A core mask replaces any configured core list, and the other way around.
    pub fn set_core_mask(&mut self, mask: String) {
        self.eal.core_mask = Some(mask);
        self.eal.core_list = None;
    }

    pub fn set_core_list(&mut self, list: String) {
        self.eal.core_list = Some(list);
        self.eal.core_mask = None;
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_eal_args() {
        let config = Config::default();
        assert_eq!(
            config.eal.builder().to_args(),
            vec!["dummy", "-n", "4", "-c", "3"]
        );
        assert_eq!(config.heartbeat.thread_id, None);
        assert_eq!(config.stop_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json() {
        let config = Config::from_json(
            r#"{
                "eal": { "core_list": "0-3", "core_mask": null, "args": ["--no-huge"] },
                "threads": { "pipeline_quanta": 128, "idle_poll_us": 250 },
                "heartbeat": { "thread_id": 2 }
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.eal.builder().to_args(),
            vec!["dummy", "-n", "4", "-l", "0-3", "--no-huge"]
        );
        assert_eq!(config.threads.pipeline_quanta, 128);
        assert_eq!(config.threads.control_interval, 16);
        assert_eq!(config.threads.idle_poll, Duration::from_micros(250));
        assert_eq!(config.heartbeat.thread_id, Some(2));
        assert_eq!(config.heartbeat.period(), Duration::from_secs(1));
    }

    #[test]
    fn test_core_set_overrides() {
        let mut config = Config::default();
        config.set_core_list("0,2".to_string());
        assert_eq!(config.eal.core_mask, None);
        config.set_core_mask("0xf".to_string());
        assert_eq!(config.eal.core_list, None);
        assert_eq!(config.eal.core_mask.as_deref(), Some("0xf"));
    }

    #[test]
    fn test_load_errors() {
        let err = Config::load(Path::new("/nonexistent/swx.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let path = std::env::temp_dir().join(format!("swx-infra-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::load(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().starts_with("failed to parse"));
    }
}
