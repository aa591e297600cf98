//! Configuration file support for keyflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (KEYFLASH_*)
//! 3. Local config file (./keyflash.toml)
//! 4. Global config file (~/.config/keyflash/config.toml)

use directories::ProjectDirs;
use keyflash::UpdaterConfig;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
}

/// Firmware location configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Root of the bundled firmware tree.
    pub dir: Option<PathBuf>,
}

/// Update session tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Countdown start value for keyboards that need a key held.
    pub countdown: Option<u32>,
    /// Seconds to wait for the keyboard to reappear in its bootloader.
    pub reacquire_timeout_secs: Option<u64>,
    /// Seconds the image write may take.
    pub write_timeout_secs: Option<u64>,
    /// Confirm the new firmware boots after flashing.
    pub verify: Option<bool>,
    /// Read the written image back from the bootloader and compare.
    pub readback: Option<bool>,
    /// Where settings backups are written.
    pub backup_dir: Option<PathBuf>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Firmware configuration.
    #[serde(default)]
    pub firmware: FirmwareConfig,
    /// Update configuration.
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("keyflash.toml")) {
            debug!("Loaded local config from keyflash.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "keyflash")
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.device.port.is_some() {
            self.device.port = other.device.port;
        }
        if other.firmware.dir.is_some() {
            self.firmware.dir = other.firmware.dir;
        }

        let update = other.update;
        if update.countdown.is_some() {
            self.update.countdown = update.countdown;
        }
        if update.reacquire_timeout_secs.is_some() {
            self.update.reacquire_timeout_secs = update.reacquire_timeout_secs;
        }
        if update.write_timeout_secs.is_some() {
            self.update.write_timeout_secs = update.write_timeout_secs;
        }
        if update.verify.is_some() {
            self.update.verify = update.verify;
        }
        if update.readback.is_some() {
            self.update.readback = update.readback;
        }
        if update.backup_dir.is_some() {
            self.update.backup_dir = update.backup_dir;
        }
    }

    /// Session settings, with `--no-verify` taking precedence over the file.
    pub fn updater_config(&self, no_verify: bool) -> UpdaterConfig {
        let mut updater = UpdaterConfig::default();
        if let Some(countdown) = self.update.countdown {
            updater.countdown_from = countdown;
        }
        if let Some(secs) = self.update.reacquire_timeout_secs {
            updater.reacquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.update.write_timeout_secs {
            updater.write_timeout = Duration::from_secs(secs);
        }
        updater.verify = !no_verify && self.update.verify.unwrap_or(true);
        updater
    }

    /// Whether the writer reads the image back. `--no-verify` turns this off
    /// too; `[update] verify` does not.
    pub fn readback(&self, no_verify: bool) -> bool {
        !no_verify && self.update.readback.unwrap_or(true)
    }

    /// Firmware root: CLI/env first, then the file, then the data directory.
    pub fn firmware_dir(&self, cli_override: Option<&Path>) -> PathBuf {
        cli_override
            .map(Path::to_path_buf)
            .or_else(|| {
                self.firmware
                    .dir
                    .clone()
            })
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("firmware")))
            .unwrap_or_else(|| PathBuf::from("firmware"))
    }

    /// Directory settings backups are written to.
    pub fn backup_dir(&self) -> PathBuf {
        self.update
            .backup_dir
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("backups")))
            .unwrap_or_else(|| PathBuf::from("backups"))
    }
}
