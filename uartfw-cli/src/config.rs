//! Configuration file support for uartfw.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (UARTFW_DEVICE, UARTFW_BAUD, UARTFW_AGENT)
//! 3. Local config file (./uartfw.toml)
//! 4. Global config file (~/.config/uartfw/config.toml)
//!
//! `--config PATH` replaces both files.

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "uartfw.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial device (e.g., "ttyUSB0" or "/dev/ttyUSB0").
    pub device: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// File transfer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Transfer agent: "builtin" or "lrzsz".
    pub agent: Option<String>,
    /// Block check of the built-in engine: "placeholder" or "crc16".
    pub check: Option<String>,
    /// Sender command line of the lrzsz agent (default "sb").
    pub sender: Option<String>,
    /// Receiver command line of the lrzsz agent (default "rb").
    pub receiver: Option<String>,
}

/// Command channel timing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Time to wait for the first byte of a command reply.
    pub command_timeout_ms: Option<u64>,
}

impl TimingConfig {
    /// Command timeout as a duration, if configured.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Timing settings.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
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

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| warn!("Failed to parse config file {}: {}", path.display(), e))
                .ok(),
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "uartfw").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set fields of `other` win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.connection.device, other.connection.device);
        take(&mut self.connection.baud, other.connection.baud);

        take(&mut self.transfer.agent, other.transfer.agent);
        take(&mut self.transfer.check, other.transfer.check);
        take(&mut self.transfer.sender, other.transfer.sender);
        take(&mut self.transfer.receiver, other.transfer.receiver);

        take(
            &mut self.timing.command_timeout_ms,
            other.timing.command_timeout_ms,
        );
    }
}
