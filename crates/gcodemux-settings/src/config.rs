//! Engine configuration
//!
//! Configuration is organized into sections:
//! - Connection defaults (baud rate, controller dialect)
//! - Streaming (receive buffer, acknowledgment timeout, status polling,
//!   firmware error policy)
//! - Devices (USB vendor/product ids recognised as CNC controllers)
//!
//! Files may be TOML or JSON; every field has a default so partial files
//! are accepted.

use crate::error::{Result, SettingsError};
use gcodemux_core::ControllerType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection defaults used when a client omits them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Controller dialect
    pub controller_type: ControllerType,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            controller_type: ControllerType::Grbl,
        }
    }
}

/// What to do with a running job when the firmware rejects one of its lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorAction {
    /// Retire the line as failed and keep streaming
    Continue,
    /// Retire the line as failed and halt the job
    Halt,
}

/// Per-code firmware error policy
///
/// Which `error:N` codes are recoverable is not something the engine
/// guesses; it is looked up here.
///
/// ```toml
/// [streaming.error_policy]
/// default = "halt"
/// continue_on = [20, 22]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPolicy {
    /// Action for codes not listed below
    pub default: ErrorAction,
    /// Codes after which the job keeps streaming
    pub continue_on: Vec<u8>,
    /// Codes after which the job halts
    pub halt_on: Vec<u8>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            default: ErrorAction::Halt,
            continue_on: Vec::new(),
            halt_on: Vec::new(),
        }
    }
}

impl ErrorPolicy {
    /// Resolve the action for a firmware error code
    pub fn action_for(&self, code: u8) -> ErrorAction {
        if self.halt_on.contains(&code) {
            ErrorAction::Halt
        } else if self.continue_on.contains(&code) {
            ErrorAction::Continue
        } else {
            self.default
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(code) = self.continue_on.iter().find(|c| self.halt_on.contains(c)) {
            return Err(SettingsError::invalid(
                "streaming.error_policy",
                format!("code {} is listed in both continue_on and halt_on", code),
            ));
        }
        Ok(())
    }
}

/// Streaming and flow control settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Firmware receive buffer size; `None` uses the dialect default
    pub rx_buffer_size: Option<usize>,
    /// How long the oldest in-flight line may wait for its acknowledgment
    pub ack_timeout_ms: u64,
    /// Interval between realtime `?` status queries
    pub status_poll_interval_ms: u64,
    /// Upper bound on unsent lines per connection
    pub max_queued_lines: usize,
    /// Firmware error policy
    pub error_policy: ErrorPolicy,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            rx_buffer_size: None,
            ack_timeout_ms: 30_000,
            status_poll_interval_ms: 250,
            max_queued_lines: 1_000_000,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl StreamingSettings {
    /// Receive buffer capacity for a dialect
    pub fn rx_buffer_size_for(&self, controller_type: ControllerType) -> usize {
        self.rx_buffer_size
            .unwrap_or_else(|| controller_type.default_rx_buffer_size())
    }

    /// Acknowledgment timeout as a duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Status poll interval as a duration
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

/// A USB vendor/product pair known to be a CNC controller (or its bridge chip)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceId {
    /// USB vendor id
    pub vid: u16,
    /// USB product id
    pub pid: u16,
    /// Display name
    #[serde(default)]
    pub name: String,
}

impl UsbDeviceId {
    fn new(vid: u16, pid: u16, name: &str) -> Self {
        Self {
            vid,
            pid,
            name: name.to_string(),
        }
    }
}

/// Device discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Devices listed by `list()`
    pub known_devices: Vec<UsbDeviceId>,
    /// Also list ports without USB ids whose names look like CNC controllers
    pub match_port_names: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            known_devices: vec![
                UsbDeviceId::new(0x2341, 0x0043, "Arduino Uno"),
                UsbDeviceId::new(0x2341, 0x0001, "Arduino Uno"),
                UsbDeviceId::new(0x2341, 0x0042, "Arduino Mega 2560"),
                UsbDeviceId::new(0x2A03, 0x0043, "Arduino Uno"),
                UsbDeviceId::new(0x1A86, 0x7523, "CH340 serial"),
                UsbDeviceId::new(0x0403, 0x6001, "FTDI FT232"),
                UsbDeviceId::new(0x0403, 0x6015, "FTDI FT231X"),
                UsbDeviceId::new(0x10C4, 0xEA60, "CP210x serial"),
                UsbDeviceId::new(0x067B, 0x2303, "Prolific PL2303"),
                UsbDeviceId::new(0x0483, 0x5740, "STM32 virtual COM"),
                UsbDeviceId::new(0x16C0, 0x0483, "Teensy"),
            ],
            match_port_names: false,
        }
    }
}

impl DeviceSettings {
    /// Whether a USB vendor/product pair is a known controller
    pub fn is_known(&self, vid: u16, pid: u16) -> bool {
        self.known_devices
            .iter()
            .any(|d| d.vid == vid && d.pid == pid)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection defaults
    pub connection: ConnectionSettings,
    /// Streaming settings
    pub streaming: StreamingSettings,
    /// Device discovery
    pub devices: DeviceSettings,
}

impl Config {
    /// Default config file location (`<config dir>/gcodemux/config.toml`)
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("gcodemux").join("config.toml"))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory("no platform config directory".to_string())
            })
    }

    /// Load the file at `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = match extension(path) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => return Err(SettingsError::UnsupportedFormat(path.display().to_string())),
        };

        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let content = match extension(path) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            _ => return Err(SettingsError::UnsupportedFormat(path.display().to_string())),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection.baud_rate == 0 {
            return Err(SettingsError::invalid(
                "connection.baud_rate",
                "must be > 0",
            ));
        }

        if self.streaming.rx_buffer_size == Some(0) {
            return Err(SettingsError::invalid(
                "streaming.rx_buffer_size",
                "must be > 0",
            ));
        }

        if self.streaming.ack_timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "streaming.ack_timeout_ms",
                "must be > 0",
            ));
        }

        if self.streaming.status_poll_interval_ms == 0 {
            return Err(SettingsError::invalid(
                "streaming.status_poll_interval_ms",
                "must be > 0",
            ));
        }

        if self.streaming.max_queued_lines == 0 {
            return Err(SettingsError::invalid(
                "streaming.max_queued_lines",
                "must be > 0",
            ));
        }

        self.streaming.error_policy.validate()
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.baud_rate, 115200);
        assert_eq!(
            config.streaming.rx_buffer_size_for(ControllerType::Grbl),
            128
        );
    }

    #[test]
    fn test_error_policy_lookup() {
        let policy = ErrorPolicy {
            default: ErrorAction::Halt,
            continue_on: vec![9, 20],
            halt_on: vec![22],
        };
        assert_eq!(policy.action_for(9), ErrorAction::Continue);
        assert_eq!(policy.action_for(22), ErrorAction::Halt);
        assert_eq!(policy.action_for(1), ErrorAction::Halt);
    }

    #[test]
    fn test_conflicting_policy_rejected() {
        let mut config = Config::default();
        config.streaming.error_policy.continue_on = vec![9];
        config.streaming.error_policy.halt_on = vec![9];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [streaming]
            rx_buffer_size = 256

            [streaming.error_policy]
            default = "continue"
            halt_on = [9]
            "#,
        )
        .unwrap();
        assert_eq!(config.streaming.rx_buffer_size, Some(256));
        assert_eq!(config.streaming.ack_timeout_ms, 30_000);
        assert_eq!(
            config.streaming.error_policy.action_for(9),
            ErrorAction::Halt
        );
        assert_eq!(
            config.streaming.error_policy.action_for(20),
            ErrorAction::Continue
        );
    }

    #[test]
    fn test_known_devices() {
        let devices = DeviceSettings::default();
        assert!(devices.is_known(0x1A86, 0x7523));
        assert!(!devices.is_known(0xFFFF, 0x0001));
    }
}
