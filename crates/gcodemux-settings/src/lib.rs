//! gcodemux Settings Crate
//!
//! Loads, validates and saves the engine configuration: connection defaults,
//! streaming limits, the firmware error policy and the known device table.

pub mod config;
pub mod error;

pub use config::{
    Config, ConnectionSettings, DeviceSettings, ErrorAction, ErrorPolicy, StreamingSettings,
    UsbDeviceId,
};
pub use error::{Result, SettingsError};
