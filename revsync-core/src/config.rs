//! Replication settings, stored as `replication-config.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::replicator::DEFAULT_SESSION_EXPIRATION_THRESHOLD;

/// File name of the configuration inside its directory
pub const CONFIG_FILE_NAME: &str = "replication-config.json";

/// Replication client and replicator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Interval between background update checks, in milliseconds.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    /// Idle time after which a replication session expires, in seconds.
    #[serde(default = "default_session_expiration_secs")]
    pub session_expiration_secs: u64,
    /// Scratch space for files fetched by in-flight sessions.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Suffix of the background update thread's name.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

fn default_update_interval_ms() -> u64 {
    60_000
}

fn default_session_expiration_secs() -> u64 {
    DEFAULT_SESSION_EXPIRATION_THRESHOLD.as_secs()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("replication-work")
}

fn default_thread_name() -> String {
    "sync".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
            session_expiration_secs: default_session_expiration_secs(),
            working_dir: default_working_dir(),
            thread_name: default_thread_name(),
        }
    }
}

impl ReplicationConfig {
    /// Load the config stored in `dir`, or the defaults if there is none.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read replication config from {:?}", config_path))?;
        let config: ReplicationConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse replication config JSON")?;
        Ok(config)
    }

    /// Save the config into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn session_expiration(&self) -> Duration {
        Duration::from_secs(self.session_expiration_secs)
    }
}
