//! Configuration file support for stkflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (STKFLASH_*)
//! 3. Local config file (./stkflash.toml), or the file given with `--config`
//! 4. Global config file (~/.config/stkflash/config.toml)
//!
//! ```toml
//! [bridge]
//! host = "192.168.4.1"
//! data_port = 8880
//! control_port = 8881
//! settle_ms = 400
//!
//! [flash]
//! device = "atmega328p"
//! verify = true
//! ```

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "stkflash.toml";

/// Bridge connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge host name or address.
    pub host: Option<String>,
    /// TCP port forwarded to the target UART.
    pub data_port: Option<u16>,
    /// TCP port accepting AT commands.
    pub control_port: Option<u16>,
    /// Delay between reset and sync, in milliseconds.
    pub settle_ms: Option<u64>,
    /// Connect and AT reply timeout, in milliseconds.
    pub connect_timeout_ms: Option<u64>,
}

/// Flashing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashSettings {
    /// Target device name (e.g. "atmega328p" or "m328p").
    pub device: Option<String>,
    /// Read pages back after writing.
    pub verify: Option<bool>,
    /// Compare the device signature with the selected device.
    pub check_signature: Option<bool>,
    /// Number of sync attempts.
    pub sync_attempts: Option<u32>,
    /// Attempts per page.
    pub page_attempts: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bridge configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashSettings,
}

impl Config {
    /// Load configuration from the global and local files.
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
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
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

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "stkflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        let Self { bridge, flash } = other;

        if bridge.host.is_some() {
            self.bridge.host = bridge.host;
        }
        if bridge.data_port.is_some() {
            self.bridge.data_port = bridge.data_port;
        }
        if bridge.control_port.is_some() {
            self.bridge.control_port = bridge.control_port;
        }
        if bridge.settle_ms.is_some() {
            self.bridge.settle_ms = bridge.settle_ms;
        }
        if bridge.connect_timeout_ms.is_some() {
            self.bridge.connect_timeout_ms = bridge.connect_timeout_ms;
        }

        if flash.device.is_some() {
            self.flash.device = flash.device;
        }
        if flash.verify.is_some() {
            self.flash.verify = flash.verify;
        }
        if flash.check_signature.is_some() {
            self.flash.check_signature = flash.check_signature;
        }
        if flash.sync_attempts.is_some() {
            self.flash.sync_attempts = flash.sync_attempts;
        }
        if flash.page_attempts.is_some() {
            self.flash.page_attempts = flash.page_attempts;
        }
    }
}
