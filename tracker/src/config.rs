use std::time::Duration;

use serde::Deserialize;

use crate::{download::DownloadTiming, errors::TrackerError};

const DEFAULT_RETENTION_WINDOW_MS: u64 = 60_000;
const DEFAULT_MAX_VISIBLE_BLOCKS: usize = 3;
const DEFAULT_DOWNLOAD_PROGRESS_MS: u64 = 2_000;
const DEFAULT_PROGRESS_TICK_MS: u64 = 100;
const DEFAULT_RETENTION_TICK_MS: u64 = 1_000;

const ENV_PREFIX: &str = "TRACKER_";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TrackerConfig {
    /// How long a fully proved block stays visible once nothing is in flight.
    #[serde(default = "default_retention_window_ms")]
    pub retention_window_ms: u64,
    /// Number of newest blocks fetched on every refetch.
    #[serde(default = "default_max_visible_blocks")]
    pub max_visible_blocks: usize,
    #[serde(default = "default_download_progress_ms")]
    pub download_progress_ms: u64,
    #[serde(default = "default_progress_tick_ms")]
    pub progress_tick_ms: u64,
    /// Cadence at which the retention window is re-evaluated without any
    /// incoming change.
    #[serde(default = "default_retention_tick_ms")]
    pub retention_tick_ms: u64,
}

impl TrackerConfig {
    /// Loads `TRACKER_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, TrackerError> {
        let cfg: TrackerConfig = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|err| TrackerError::Config(err.to_string()))?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    pub fn ensure_valid(&self) -> Result<(), TrackerError> {
        if self.retention_window_ms == 0 {
            return Err(TrackerError::Config(
                "retention_window_ms must be greater than zero".to_owned(),
            ));
        }
        if self.max_visible_blocks == 0 {
            return Err(TrackerError::Config(
                "max_visible_blocks must be greater than zero".to_owned(),
            ));
        }
        if self.download_progress_ms == 0 {
            return Err(TrackerError::Config(
                "download_progress_ms must be greater than zero".to_owned(),
            ));
        }
        if self.progress_tick_ms == 0 {
            return Err(TrackerError::Config(
                "progress_tick_ms must be greater than zero".to_owned(),
            ));
        }
        if self.progress_tick_ms > self.download_progress_ms {
            return Err(TrackerError::Config(
                "progress_tick_ms must not exceed download_progress_ms".to_owned(),
            ));
        }
        if self.retention_tick_ms == 0 {
            return Err(TrackerError::Config(
                "retention_tick_ms must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_millis(self.retention_window_ms)
    }

    pub fn retention_tick(&self) -> Duration {
        Duration::from_millis(self.retention_tick_ms)
    }

    pub fn download_timing(&self) -> DownloadTiming {
        DownloadTiming {
            progress_duration: Duration::from_millis(self.download_progress_ms),
            tick: Duration::from_millis(self.progress_tick_ms),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retention_window_ms: default_retention_window_ms(),
            max_visible_blocks: default_max_visible_blocks(),
            download_progress_ms: default_download_progress_ms(),
            progress_tick_ms: default_progress_tick_ms(),
            retention_tick_ms: default_retention_tick_ms(),
        }
    }
}

fn default_retention_window_ms() -> u64 {
    DEFAULT_RETENTION_WINDOW_MS
}

fn default_max_visible_blocks() -> usize {
    DEFAULT_MAX_VISIBLE_BLOCKS
}

fn default_download_progress_ms() -> u64 {
    DEFAULT_DOWNLOAD_PROGRESS_MS
}

fn default_progress_tick_ms() -> u64 {
    DEFAULT_PROGRESS_TICK_MS
}

fn default_retention_tick_ms() -> u64 {
    DEFAULT_RETENTION_TICK_MS
}
