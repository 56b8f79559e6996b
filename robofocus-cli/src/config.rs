//! Configuration file support for robofocus.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ROBOFOCUS_*)
//! 3. Explicit config file (`--config PATH`)
//! 4. Local config file (./robofocus.toml)
//! 5. Global config file (~/.config/robofocus/config.toml)
//!
//! Files are merged table by table, so a later file only needs the keys it
//! changes.

use directories::ProjectDirs;
use log::{debug, info, warn};
use robofocus::{FocuserSettings, RetryPolicy, SimulatorConfig, SettingsStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "robofocus.toml";

/// Persisted focuser settings file name.
pub const SETTINGS_FILE: &str = "robofocus_settings.toml";

/// Serial connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Per-command response timeout.
    pub timeout_secs: f64,
    /// Per-port handshake timeout while scanning.
    pub scan_timeout_secs: f64,
    /// Probe Bluetooth serial ports too.
    pub include_bluetooth: bool,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: None,
            timeout_secs: 5.0,
            scan_timeout_secs: 1.0,
            include_bluetooth: false,
        }
    }
}

/// Simulator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSection {
    /// Use the simulator instead of real hardware.
    pub enabled: bool,
    /// Starting position.
    pub initial_position: u32,
    /// Hardware travel limit.
    pub max_travel: u32,
    /// Simulated movement speed.
    pub speed_steps_per_sec: u32,
    /// Firmware version reported on connect.
    pub firmware_version: String,
    /// Simulated temperature.
    pub temperature_celsius: f64,
    /// Temperature noise amplitude.
    pub temperature_noise: f64,
    /// Temperature drift per hour.
    pub temperature_drift_per_hour: f64,
    /// Artificial response delay.
    pub response_latency_ms: u64,
    /// Time out every command.
    pub inject_timeout: bool,
    /// Probability of a corrupted reply checksum.
    pub checksum_error_rate: f64,
}

impl Default for SimulatorSection {
    fn default() -> Self {
        let defaults = SimulatorConfig::default();
        Self {
            enabled: false,
            initial_position: defaults.initial_position,
            max_travel: defaults.max_travel,
            speed_steps_per_sec: defaults.speed_steps_per_sec,
            firmware_version: defaults.firmware_version,
            temperature_celsius: defaults.temperature_celsius,
            temperature_noise: defaults.temperature_noise,
            temperature_drift_per_hour: defaults.temperature_drift_per_hour,
            response_latency_ms: 0,
            inject_timeout: defaults.inject_timeout,
            checksum_error_rate: defaults.checksum_error_rate,
        }
    }
}

impl SimulatorSection {
    /// Engine configuration for these settings.
    pub fn engine_config(&self, retry: RetryPolicy) -> SimulatorConfig {
        SimulatorConfig {
            initial_position: self.initial_position,
            max_travel: self.max_travel,
            speed_steps_per_sec: self.speed_steps_per_sec,
            firmware_version: self.firmware_version.clone(),
            temperature_celsius: self.temperature_celsius,
            temperature_noise: self.temperature_noise,
            temperature_drift_per_hour: self.temperature_drift_per_hour,
            response_latency: Duration::from_millis(self.response_latency_ms),
            inject_timeout: self.inject_timeout,
            checksum_error_rate: self.checksum_error_rate,
            retry,
            ..Default::default()
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial connection.
    pub serial: SerialSection,
    /// Simulator.
    pub simulator: SimulatorSection,
    /// Focuser defaults, used until settings are first saved.
    pub focuser: FocuserSettings,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load(explicit: Option<&Path>) -> Self {
        let mut merged = toml::Table::new();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(table) = Self::load_table(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                merge_tables(&mut merged, table);
            }
        }

        if let Some(table) = Self::load_table(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            merge_tables(&mut merged, table);
        }

        if let Some(path) = explicit {
            if let Some(table) = Self::load_table(path) {
                debug!("Loaded config from {}", path.display());
                merge_tables(&mut merged, table);
            } else {
                warn!(
                    "Could not load config from {}, using defaults",
                    path.display()
                );
            }
        }

        match merged.try_into() {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid configuration values, using defaults: {e}");
                Self::default()
            },
        }
    }

    /// Read one config file as a TOML table.
    fn load_table(path: &Path) -> Option<toml::Table> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match content.parse::<toml::Table>() {
                Ok(table) => Some(table),
                Err(e) => {
                    warn!("Failed to parse TOML config file {}: {}", path.display(), e);
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
        ProjectDirs::from("", "", "robofocus").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Default location of the persisted focuser settings.
    pub fn default_settings_path() -> PathBuf {
        Self::global_config_dir().map_or_else(|| PathBuf::from(SETTINGS_FILE), |dir| {
            dir.join(SETTINGS_FILE)
        })
    }
}

/// Recursively merge `other` into `base`; scalar values in `other` win.
fn merge_tables(base: &mut toml::Table, other: toml::Table) {
    for (key, value) in other {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            },
            (_, value) => {
                base.insert(key, value);
            },
        }
    }
}

/// Focuser settings persisted as TOML.
#[derive(Debug)]
pub struct TomlSettingsStore {
    path: PathBuf,
    defaults: FocuserSettings,
}

impl TomlSettingsStore {
    /// Store at `path`; `defaults` apply until the file exists.
    pub fn new(path: PathBuf, defaults: FocuserSettings) -> Self {
        Self { path, defaults }
    }

    /// File the settings are saved to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load(&self) -> robofocus::Result<FocuserSettings> {
        if !self.path.exists() {
            debug!(
                "No settings file at {}, using configured defaults",
                self.path.display()
            );
            return Ok(self.defaults.clone());
        }

        let content = fs::read_to_string(&self.path)?;
        toml::from_str(&content).map_err(|e| {
            robofocus::Error::Config(format!("invalid settings file {}: {e}", self.path.display()))
        })
    }

    fn save(&self, settings: &FocuserSettings) -> robofocus::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(settings)
            .map_err(|e| robofocus::Error::Config(format!("cannot serialize settings: {e}")))?;
        fs::write(&self.path, content)?;
        info!("Saved focuser settings to {}", self.path.display());
        Ok(())
    }
}
