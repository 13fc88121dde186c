//! Data models for positions, controller state and machine status
//!
//! This module provides:
//! - 6-axis positions in machine units
//! - The controller state machine states
//! - The mirrored machine status a connection keeps for its observers
//! - Job and sender progress snapshots (see [`job`])

pub mod job;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use job::{JobStatus, SenderStatus, WorkflowState};

/// Machine coordinate units (millimeters or inches)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Units {
    /// Millimeters (metric)
    #[default]
    MM,
    /// Inches (imperial)
    INCH,
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::MM => write!(f, "mm"),
            Units::INCH => write!(f, "in"),
        }
    }
}

/// A 6-axis coordinate as reported by the firmware
///
/// Axes the firmware did not report stay at zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CNCPoint {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
    /// A-axis (4th axis) position
    pub a: f64,
    /// B-axis (5th axis) position
    pub b: f64,
    /// C-axis (6th axis) position
    pub c: f64,
}

impl CNCPoint {
    /// Build a point from up to six reported axis values
    pub fn from_axes(values: &[f64]) -> Self {
        let axis = |i: usize| values.get(i).copied().unwrap_or(0.0);
        Self {
            x: axis(0),
            y: axis(1),
            z: axis(2),
            a: axis(3),
            b: axis(4),
            c: axis(5),
        }
    }

    /// Component-wise sum
    pub fn add(&self, other: &CNCPoint) -> CNCPoint {
        CNCPoint {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
            a: self.a + other.a,
            b: self.b + other.b,
            c: self.c + other.c,
        }
    }

    /// Component-wise difference
    pub fn subtract(&self, other: &CNCPoint) -> CNCPoint {
        CNCPoint {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
            a: self.a - other.a,
            b: self.b - other.b,
            c: self.c - other.c,
        }
    }
}

impl fmt::Display for CNCPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X:{:.3} Y:{:.3} Z:{:.3}", self.x, self.y, self.z)
    }
}

/// Machine/Controller state machine states
///
/// `Disconnected → Connecting → {Idle, Run, Hold, ...} → Disconnected`.
/// Every state other than `Disconnected` and `Connecting` is a connected
/// sub-state reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControllerState {
    /// Not connected to any controller
    #[default]
    Disconnected,
    /// Port open, waiting for the firmware to report in
    Connecting,
    /// Connected and idle, ready for commands
    Idle,
    /// Executing motion
    Run,
    /// Feed hold active
    Hold,
    /// Jogging
    Jog,
    /// Alarm lock (requires unlock or reset)
    Alarm,
    /// Check mode (dry-run without machine movement)
    Check,
    /// Safety door interlock triggered
    Door,
    /// Homing cycle in progress
    Home,
    /// Low-power sleep
    Sleep,
}

impl ControllerState {
    /// Parse the state word of a GRBL status report
    pub fn from_grbl(word: &str) -> Option<Self> {
        Some(match word {
            "Idle" => Self::Idle,
            "Run" => Self::Run,
            "Hold" => Self::Hold,
            "Jog" => Self::Jog,
            "Alarm" => Self::Alarm,
            "Check" => Self::Check,
            "Door" => Self::Door,
            "Home" => Self::Home,
            "Sleep" => Self::Sleep,
            _ => return None,
        })
    }

    /// Check if this state indicates the controller is connected
    pub fn is_connected(&self) -> bool {
        !matches!(
            self,
            ControllerState::Disconnected | ControllerState::Connecting
        )
    }

    /// Check if this state indicates active motion
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            ControllerState::Run | ControllerState::Jog | ControllerState::Home
        )
    }

    /// States in which the firmware legitimately stops acknowledging lines
    pub fn is_holding(&self) -> bool {
        matches!(self, ControllerState::Hold | ControllerState::Door)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Idle => write!(f, "Idle"),
            Self::Run => write!(f, "Run"),
            Self::Hold => write!(f, "Hold"),
            Self::Jog => write!(f, "Jog"),
            Self::Alarm => write!(f, "Alarm"),
            Self::Check => write!(f, "Check"),
            Self::Door => write!(f, "Door"),
            Self::Home => write!(f, "Home"),
            Self::Sleep => write!(f, "Sleep"),
        }
    }
}

/// Supported controller dialects (GRBL family only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControllerType {
    /// GRBL 1.1 (default, most common)
    #[default]
    Grbl,
    /// grblHAL (GRBL protocol with a larger receive buffer)
    GrblHal,
}

impl ControllerType {
    /// Serial receive buffer size the firmware ships with
    pub fn default_rx_buffer_size(&self) -> usize {
        match self {
            Self::Grbl => 128,
            Self::GrblHal => 1024,
        }
    }
}

impl std::str::FromStr for ControllerType {
    type Err = crate::error::ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grbl" => Ok(Self::Grbl),
            "grblhal" | "grbl_hal" => Ok(Self::GrblHal),
            _ => Err(crate::error::ConnectionError::UnsupportedController {
                controller_type: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grbl => write!(f, "Grbl"),
            Self::GrblHal => write!(f, "grblHAL"),
        }
    }
}

/// Feed, rapid and spindle override percentages (`Ov:` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideState {
    /// Feed override percentage
    pub feed: u16,
    /// Rapid override percentage
    pub rapid: u16,
    /// Spindle override percentage
    pub spindle: u16,
}

impl Default for OverrideState {
    fn default() -> Self {
        Self {
            feed: 100,
            rapid: 100,
            spindle: 100,
        }
    }
}

/// Planner blocks and RX bytes available (`Bf:` / `Buf:` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferState {
    /// Free planner blocks
    pub planner: u16,
    /// Free RX buffer bytes
    pub rx: u16,
}

/// Modal state reported by `$G` (`[GC:...]`)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModalState {
    /// Motion mode (G0, G1, G2, G3, G38.x, G80)
    pub motion: Option<String>,
    /// Work coordinate system (G54..G59)
    pub wcs: Option<String>,
    /// Plane (G17, G18, G19)
    pub plane: Option<String>,
    /// Units (G20, G21)
    pub units: Option<String>,
    /// Distance mode (G90, G91)
    pub distance: Option<String>,
    /// Feed rate mode (G93, G94)
    pub feed_rate_mode: Option<String>,
    /// Program flow (M0, M1, M2, M30)
    pub program: Option<String>,
    /// Spindle state (M3, M4, M5)
    pub spindle: Option<String>,
    /// Coolant state (M7, M8, M9; may hold two words)
    pub coolant: Vec<String>,
    /// Tool number
    pub tool: Option<u32>,
    /// Programmed feed rate
    pub feed_rate: Option<f64>,
    /// Programmed spindle speed
    pub spindle_speed: Option<f64>,
}

impl ModalState {
    /// Units implied by the modal G20/G21 word
    pub fn units(&self) -> Units {
        match self.units.as_deref() {
            Some("G20") => Units::INCH,
            _ => Units::MM,
        }
    }
}

/// The mirrored machine status of one physical connection
///
/// Written only by the connection's controller; everything else reads
/// snapshots of it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineStatus {
    /// Controller state
    pub state: ControllerState,
    /// Sub-state code (`Hold:0`, `Door:1`, ...)
    pub sub_state: Option<u8>,
    /// Machine position
    pub machine_position: CNCPoint,
    /// Work position
    pub work_position: CNCPoint,
    /// Last reported work coordinate offset
    pub work_coordinate_offset: Option<CNCPoint>,
    /// Current feed rate
    pub feed_rate: Option<f64>,
    /// Current spindle speed
    pub spindle_speed: Option<f64>,
    /// Override percentages
    pub overrides: OverrideState,
    /// Planner and RX availability
    pub buffer: Option<BufferState>,
    /// Triggered input pins (`Pn:` letters)
    pub pins: Option<String>,
    /// Active alarm code, set until unlock or reset
    pub alarm: Option<u8>,
    /// Modal state from the last `$G` report
    pub modal: ModalState,
    /// Firmware banner version (e.g. `1.1h`)
    pub firmware_version: Option<String>,
    /// Firmware `$n` settings
    pub settings: BTreeMap<u16, String>,
    /// Stored parameters from `$#` (`G54`, `G28`, `TLO`, `PRB`, ...)
    pub parameters: BTreeMap<String, String>,
}

impl MachineStatus {
    /// Status for a freshly opened port
    pub fn connecting() -> Self {
        Self {
            state: ControllerState::Connecting,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_grbl_state_words() {
        assert_eq!(ControllerState::from_grbl("Idle"), Some(ControllerState::Idle));
        assert_eq!(ControllerState::from_grbl("Door"), Some(ControllerState::Door));
        assert_eq!(ControllerState::from_grbl("Bogus"), None);
    }

    #[test]
    fn test_connected_states() {
        assert!(!ControllerState::Disconnected.is_connected());
        assert!(!ControllerState::Connecting.is_connected());
        assert!(ControllerState::Alarm.is_connected());
        assert!(ControllerState::Hold.is_holding());
        assert!(!ControllerState::Run.is_holding());
    }

    #[test]
    fn test_point_arithmetic() {
        let mpos = CNCPoint::from_axes(&[10.0, 5.0, -1.0]);
        let wco = CNCPoint::from_axes(&[2.0, 2.0, 2.0]);
        let wpos = mpos.subtract(&wco);
        assert_eq!(wpos, CNCPoint::from_axes(&[8.0, 3.0, -3.0]));
        assert_eq!(wpos.add(&wco), mpos);
    }

    #[test]
    fn test_controller_type_parsing() {
        assert_eq!("Grbl".parse::<ControllerType>(), Ok(ControllerType::Grbl));
        assert_eq!("grblHAL".parse::<ControllerType>(), Ok(ControllerType::GrblHal));
        assert!("Smoothie".parse::<ControllerType>().is_err());
        assert_eq!(ControllerType::Grbl.default_rx_buffer_size(), 128);
    }

    #[test]
    fn test_modal_units() {
        let mut modal = ModalState::default();
        assert_eq!(modal.units(), Units::MM);
        modal.units = Some("G20".into());
        assert_eq!(modal.units(), Units::INCH);
    }
}
