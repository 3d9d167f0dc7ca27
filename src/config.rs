//! Engine configuration
//!
//! Tuning knobs that are not part of any single operation. Device ids,
//! stream names and gains travel with each call instead.

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{DEFAULT_METER_WINDOW_MS, DEFAULT_ROLLING_SECONDS};
use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = "engine.toml";
const CAPTURE_DIR_NAME: &str = "PadCaptures";

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rolling capture length used when a caller passes 0 seconds
    pub rolling_seconds: u32,
    /// Metering window used when a caller passes 0 ms
    pub meter_window_ms: u32,
    /// Where committed captures land; user documents dir when unset
    pub capture_dir: Option<PathBuf>,
    pub network: NetworkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rolling_seconds: DEFAULT_ROLLING_SECONDS,
            meter_window_ms: DEFAULT_METER_WINDOW_MS,
            capture_dir: None,
            network: NetworkConfig::default(),
        }
    }
}

/// UDP socket tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub recv_buffer_bytes: usize,
    pub send_buffer_bytes: usize,
    /// Receive timeout; bounds how long a stopping receiver takes to exit
    pub recv_poll_ms: u64,
    /// Back-off after a socket-level receive error
    pub recv_retry_ms: u64,
    /// Rejected packets tolerated per sender per second before the
    /// sender is ignored for the rest of the window
    pub reject_budget_per_sec: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            recv_buffer_bytes: 1_048_576,
            send_buffer_bytes: 1_048_576,
            recv_poll_ms: 100,
            recv_retry_ms: 25,
            reject_budget_per_sec: 200,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from a file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load from the platform config directory
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// `<config dir>/engine.toml` for this application
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pad-audio-engine")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Directory committed captures are written to
    pub fn capture_dir(&self) -> PathBuf {
        if let Some(dir) = &self.capture_dir {
            return dir.clone();
        }
        UserDirs::new()
            .and_then(|u| u.document_dir().map(Path::to_path_buf))
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CAPTURE_DIR_NAME)
    }

    pub(crate) fn rolling_seconds_or_default(&self, seconds: u32) -> u32 {
        if seconds == 0 {
            self.rolling_seconds.max(1)
        } else {
            seconds
        }
    }

    pub(crate) fn meter_window_or_default(&self, window_ms: u32) -> u32 {
        if window_ms == 0 {
            self.meter_window_ms.max(1)
        } else {
            window_ms
        }
    }
}
