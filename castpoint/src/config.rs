//! Runtime configuration for the orchestrator.
//!
//! Loaded from YAML, with every field optional. The struct is built by
//! the embedder and handed to [`crate::point::CastPoint`] explicitly;
//! there is no process-global configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LAUNCH_DEADLINE_SECS: u64 = 20;
const DEFAULT_DISCOVERY_RETRY_SECS: u64 = 10;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CastPointConfig {
    /// How long a correlated command may stay unanswered.
    pub request_timeout_secs: u64,
    /// How long a launched application may take to show up in a
    /// receiver status before the pending session is abandoned.
    pub launch_deadline_secs: u64,
    /// Fixed delay between attempts to re-open the discovery channel.
    pub discovery_retry_secs: u64,
    /// Period of the timeout sweep.
    pub tick_interval_ms: u64,
    /// Ask the discovery backend to keep device channels open and relay
    /// status frames.
    pub watch_device_status: bool,
    /// Offer desktop mirroring to trusted selection requests.
    pub desktop_mirroring: bool,
}

impl Default for CastPointConfig {
    fn default() -> Self {
        CastPointConfig {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            launch_deadline_secs: DEFAULT_LAUNCH_DEADLINE_SECS,
            discovery_retry_secs: DEFAULT_DISCOVERY_RETRY_SECS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            watch_device_status: true,
            desktop_mirroring: false,
        }
    }
}

impl CastPointConfig {
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn launch_deadline(&self) -> Duration {
        Duration::from_secs(self.launch_deadline_secs)
    }

    pub fn discovery_retry(&self) -> Duration {
        Duration::from_secs(self.discovery_retry_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
