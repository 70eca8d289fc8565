//! # Configuration Management Module
//!
//! Persistent application settings stored in platform-appropriate locations,
//! plus the per-session device configuration handed to the service at start.
//!
//! ## Settings
//! - `draw_in_background`: Forward display samples even when no client is bound
//! - `output_dir`: Where finished recordings are stored
//! - `frame_buffer_size`: Frames per device buffer requested at acquisition start
//! - `drain_poll_ms`: Upper bound on how long the stop path sleeps between checks
//!   for an in-flight write
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/bplux-recorder/config.toml
//! - Linux: ~/.config/bplux-recorder/config.toml
//! - Windows: %APPDATA%\bplux-recorder\config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "bplux-recorder";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub draw_in_background: bool,
    pub output_dir: PathBuf,
    pub frame_buffer_size: u32,
    pub drain_poll_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            draw_in_background: true,
            output_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join("recordings"),
            frame_buffer_size: 10,
            drain_poll_ms: 100,
        }
    }
}

impl Settings {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load settings from the default location, creating defaults if missing
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load settings from `path`, or create and save defaults if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let settings = toml::from_str(&contents).map_err(ConfigError::ParseFailed)?;
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::default();
                settings.save_to(path)?;
                Ok(settings)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save settings to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms.max(1))
    }
}

/// Device setup for one acquisition session. Never mutated once the session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    pub name: String,
    pub mac_address: String,
    pub active_channels: Vec<u8>,
    pub number_of_bits: u8,
    pub sampling_frequency: u32,
    pub visualization_frequency: u32,
}

impl DeviceConfiguration {
    pub const MAX_CHANNELS: u8 = 8;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling_frequency == 0 || self.visualization_frequency == 0 {
            return Err(ConfigError::Invalid(
                "sampling and visualization frequencies must be positive".to_string(),
            ));
        }
        if self.visualization_frequency > self.sampling_frequency {
            return Err(ConfigError::Invalid(format!(
                "visualization frequency {} Hz exceeds sampling frequency {} Hz",
                self.visualization_frequency, self.sampling_frequency
            )));
        }
        if self.active_channels.is_empty() {
            return Err(ConfigError::Invalid("no active channels".to_string()));
        }
        let mut seen = [false; Self::MAX_CHANNELS as usize];
        for &channel in &self.active_channels {
            if channel == 0 || channel > Self::MAX_CHANNELS {
                return Err(ConfigError::Invalid(format!("channel {} out of range", channel)));
            }
            let slot = &mut seen[channel as usize - 1];
            if *slot {
                return Err(ConfigError::Invalid(format!("channel {} listed twice", channel)));
            }
            *slot = true;
        }
        if !matches!(self.number_of_bits, 8 | 12 | 16) {
            return Err(ConfigError::Invalid(format!(
                "unsupported sample width of {} bits",
                self.number_of_bits
            )));
        }
        Ok(())
    }
}

/// Everything the service needs to start a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub recording_name: String,
    pub configuration: DeviceConfiguration,
}

#[cfg(test)]
pub(crate) fn test_configuration(sampling: u32, visualization: u32, bits: u8) -> DeviceConfiguration {
    DeviceConfiguration {
        name: "test".to_string(),
        mac_address: "00:07:80:4D:2E:76".to_string(),
        active_channels: vec![1, 2],
        number_of_bits: bits,
        sampling_frequency: sampling,
        visualization_frequency: visualization,
    }
}
