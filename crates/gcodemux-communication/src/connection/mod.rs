//! Per-device connection tasks

pub mod manager;

pub use manager::{spawn, ConnectionHandle, PortRequest, PortSnapshot};
