//! Events broadcast to the clients attached to a port
//!
//! Every event names the port it belongs to, so a client that joined several
//! rooms can demultiplex them. Events serialize with an `event` tag carrying
//! the wire name (`serialport:read`, `task:finish`, ...).

use crate::data::{JobStatus, MachineStatus, SenderStatus, WorkflowState};
use crate::error::FirmwareError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identity of one UI-facing client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Create a new unique client id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an outgoing line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    /// Typed or issued by a client (console, jog, unlock...)
    #[default]
    Client,
    /// A line of the loaded program
    Job,
    /// Issued by the engine itself (queries after connect or reset)
    Engine,
}

/// Attribution attached to every outgoing line
///
/// Echoed back in `serialport:write` so a UI can suppress its own lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteContext {
    /// The client that caused the write, if any
    pub sender: Option<ClientId>,
    /// What kind of line it is
    pub source: CommandSource,
}

impl WriteContext {
    /// A line issued by a client
    pub fn client(id: ClientId) -> Self {
        Self {
            sender: Some(id),
            source: CommandSource::Client,
        }
    }

    /// A line of the loaded program, started by `started_by`
    pub fn job(started_by: Option<ClientId>) -> Self {
        Self {
            sender: started_by,
            source: CommandSource::Job,
        }
    }

    /// A line issued by the engine
    pub fn engine() -> Self {
        Self {
            sender: None,
            source: CommandSource::Engine,
        }
    }
}

/// Machine-readable halt category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltCode {
    /// `ALARM:` line
    FirmwareAlarm,
    /// `error:` line whose policy is halt
    FirmwareError,
    /// Byte accounting lost
    ProtocolDesync,
    /// The device went away
    TransportError,
}

impl fmt::Display for HaltCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirmwareAlarm => write!(f, "firmware_alarm"),
            Self::FirmwareError => write!(f, "firmware_error"),
            Self::ProtocolDesync => write!(f, "protocol_desync"),
            Self::TransportError => write!(f, "transport_error"),
        }
    }
}

/// Structured reason broadcast whenever streaming halts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltReason {
    /// Category
    pub code: HaltCode,
    /// Human readable detail
    pub message: String,
}

impl HaltReason {
    /// Halt caused by a lost or failing device
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: HaltCode::TransportError,
            message: message.into(),
        }
    }
}

impl From<&FirmwareError> for HaltReason {
    fn from(err: &FirmwareError) -> Self {
        let code = match err {
            FirmwareError::Error { .. } => HaltCode::FirmwareError,
            FirmwareError::Alarm { .. } => HaltCode::FirmwareAlarm,
            FirmwareError::ProtocolDesync { .. } => HaltCode::ProtocolDesync,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Event broadcast to every client attached to a port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    /// The port is open (sent to the opener and to each hot-attaching client)
    #[serde(rename = "serialport:open")]
    SerialPortOpen {
        /// Device path
        port: String,
        /// Baud rate
        baud_rate: u32,
        /// Controller dialect name
        controller_type: String,
        /// Whether the port was already open before this client attached
        in_use: bool,
    },
    /// The port closed
    #[serde(rename = "serialport:close")]
    SerialPortClose {
        /// Device path
        port: String,
    },
    /// The device reported an I/O failure
    #[serde(rename = "serialport:error")]
    SerialPortError {
        /// Device path
        port: String,
        /// Failure detail
        message: String,
    },
    /// A raw line from the firmware
    #[serde(rename = "serialport:read")]
    SerialPortRead {
        /// Device path
        port: String,
        /// The line without its terminator
        line: String,
    },
    /// Data written to the firmware
    #[serde(rename = "serialport:write")]
    SerialPortWrite {
        /// Device path
        port: String,
        /// The written text (realtime bytes are sent as one-character strings)
        data: String,
        /// Who caused the write
        context: WriteContext,
    },
    /// The mirrored machine status changed
    #[serde(rename = "controller:state")]
    ControllerStatus {
        /// Device path
        port: String,
        /// Current mirror
        status: Box<MachineStatus>,
    },
    /// Firmware settings or version changed
    #[serde(rename = "controller:settings")]
    ControllerSettings {
        /// Device path
        port: String,
        /// Firmware banner version
        firmware_version: Option<String>,
        /// `$n` settings
        settings: BTreeMap<u16, String>,
    },
    /// Ledger, queues or job progress changed
    #[serde(rename = "sender:status")]
    SenderStatus {
        /// Device path
        port: String,
        /// Ledger snapshot
        status: SenderStatus,
        /// Loaded job, if any
        job: Option<JobStatus>,
    },
    /// Job workflow state changed
    #[serde(rename = "workflow:state")]
    WorkflowState {
        /// Device path
        port: String,
        /// New state
        state: WorkflowState,
    },
    /// Streaming halted
    #[serde(rename = "controller:halt")]
    Halted {
        /// Device path
        port: String,
        /// Why
        reason: HaltReason,
    },
    /// A job started streaming
    #[serde(rename = "task:start")]
    TaskStart {
        /// Device path
        port: String,
        /// Job metadata
        job: JobStatus,
    },
    /// Every line of a job was acknowledged
    #[serde(rename = "task:finish")]
    TaskFinish {
        /// Device path
        port: String,
        /// Job metadata
        job: JobStatus,
    },
    /// A running job halted
    #[serde(rename = "task:error")]
    TaskError {
        /// Device path
        port: String,
        /// Job metadata at the time of the halt
        job: JobStatus,
        /// Why
        reason: HaltReason,
    },
}

impl EngineEvent {
    /// The port this event belongs to
    pub fn port(&self) -> &str {
        match self {
            Self::SerialPortOpen { port, .. }
            | Self::SerialPortClose { port }
            | Self::SerialPortError { port, .. }
            | Self::SerialPortRead { port, .. }
            | Self::SerialPortWrite { port, .. }
            | Self::ControllerStatus { port, .. }
            | Self::ControllerSettings { port, .. }
            | Self::SenderStatus { port, .. }
            | Self::WorkflowState { port, .. }
            | Self::Halted { port, .. }
            | Self::TaskStart { port, .. }
            | Self::TaskFinish { port, .. }
            | Self::TaskError { port, .. } => port,
        }
    }

    /// The wire name of this event
    pub fn name(&self) -> &'static str {
        match self {
            Self::SerialPortOpen { .. } => "serialport:open",
            Self::SerialPortClose { .. } => "serialport:close",
            Self::SerialPortError { .. } => "serialport:error",
            Self::SerialPortRead { .. } => "serialport:read",
            Self::SerialPortWrite { .. } => "serialport:write",
            Self::ControllerStatus { .. } => "controller:state",
            Self::ControllerSettings { .. } => "controller:settings",
            Self::SenderStatus { .. } => "sender:status",
            Self::WorkflowState { .. } => "workflow:state",
            Self::Halted { .. } => "controller:halt",
            Self::TaskStart { .. } => "task:start",
            Self::TaskFinish { .. } => "task:finish",
            Self::TaskError { .. } => "task:error",
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerialPortOpen {
                port, baud_rate, ..
            } => write!(f, "[{}] open at {} baud", port, baud_rate),
            Self::SerialPortClose { port } => write!(f, "[{}] closed", port),
            Self::SerialPortError { port, message } => write!(f, "[{}] error: {}", port, message),
            Self::SerialPortRead { port, line } => write!(f, "[{}] < {}", port, line),
            Self::SerialPortWrite { port, data, .. } => {
                write!(f, "[{}] > {}", port, data.trim_end())
            }
            Self::ControllerStatus { port, status } => {
                write!(f, "[{}] {} {}", port, status.state, status.work_position)
            }
            Self::ControllerSettings { port, settings, .. } => {
                write!(f, "[{}] {} settings", port, settings.len())
            }
            Self::SenderStatus { port, status, .. } => write!(
                f,
                "[{}] {}/{} bytes in flight",
                port, status.bytes_in_flight, status.capacity
            ),
            Self::WorkflowState { port, state } => write!(f, "[{}] workflow {}", port, state),
            Self::Halted { port, reason } => write!(f, "[{}] halted ({})", port, reason),
            Self::TaskStart { port, job } => write!(f, "[{}] started {}", port, job.name),
            Self::TaskFinish { port, job } => write!(f, "[{}] finished {}", port, job.name),
            Self::TaskError { port, job, reason } => {
                write!(f, "[{}] {} failed ({})", port, job.name, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_tag() {
        let event = EngineEvent::SerialPortRead {
            port: "COM3".into(),
            line: "ok".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "serialport:read");
        assert_eq!(json["port"], "COM3");
        assert_eq!(event.name(), "serialport:read");
    }

    #[test]
    fn test_halt_reason_from_firmware_error() {
        let reason = HaltReason::from(&FirmwareError::Alarm {
            code: 1,
            message: "Hard limit".into(),
        });
        assert_eq!(reason.code, HaltCode::FirmwareAlarm);
        assert!(reason.message.contains("ALARM:1"));

        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["code"], "firmware_alarm");
    }

    #[test]
    fn test_write_context_attribution() {
        let id = ClientId::new();
        let ctx = WriteContext::client(id);
        assert_eq!(ctx.sender, Some(id));
        assert_eq!(ctx.source, CommandSource::Client);
        assert_eq!(WriteContext::engine().sender, None);
    }
}
