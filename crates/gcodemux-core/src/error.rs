//! Error handling for gcodemux
//!
//! Error types for every layer of the engine:
//! - Connection errors (device ownership and transport failures)
//! - Controller errors (requests rejected by the sender or state machine)
//! - Firmware errors (conditions reported by, or inferred from, the firmware)
//!
//! All error types use `thiserror`.

use thiserror::Error;

/// Connection error type
///
/// Returned synchronously to the requester. A connection error on one port
/// never affects any other port.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The device path is already owned by another connection manager, or is
    /// open at different settings.
    #[error("Port unavailable: {port} ({reason})")]
    PortUnavailable {
        /// The device path.
        port: String,
        /// Why the port could not be claimed.
        reason: String,
    },

    /// OS-level I/O or hardware failure
    #[error("Transport error on {port}: {reason}")]
    Transport {
        /// The device path.
        port: String,
        /// The underlying failure.
        reason: String,
    },

    /// No open connection exists for this path
    #[error("Port not open: {port}")]
    NotOpen {
        /// The device path.
        port: String,
    },

    /// The requested controller dialect is not a GRBL-family firmware
    #[error("Unsupported controller type: {controller_type}")]
    UnsupportedController {
        /// The requested controller type name.
        controller_type: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },

    /// The client session is unknown to the engine
    #[error("Unknown client: {client}")]
    UnknownClient {
        /// The client identifier.
        client: String,
    },

    /// The connection task stopped before answering
    #[error("Connection to {port} is shutting down")]
    ShuttingDown {
        /// The device path.
        port: String,
    },
}

/// Controller error type
///
/// Requests the streaming sender or the controller state machine refuses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Line can never fit in the firmware receive buffer
    #[error("Line is {length} bytes, larger than the {capacity} byte receive buffer")]
    LineTooLong {
        /// Wire length of the line including its terminator.
        length: usize,
        /// Receive buffer capacity.
        capacity: usize,
    },

    /// Too many lines are waiting to be sent
    #[error("Send queue is full ({limit} lines)")]
    QueueFull {
        /// The configured queue limit.
        limit: usize,
    },

    /// The controller has not reported in yet
    #[error("Controller not connected")]
    NotConnected,

    /// The firmware is in alarm and must be unlocked first
    #[error("Controller is in alarm {code}; unlock or reset first")]
    AlarmActive {
        /// The active alarm code.
        code: u8,
    },

    /// Byte accounting is no longer trusted
    #[error("Connection is desynchronized; reset the controller first")]
    Desynchronized,

    /// A job operation was requested but nothing is loaded
    #[error("No G-code program loaded")]
    NoJobLoaded,

    /// A job operation was requested in the wrong workflow state
    #[error("Cannot {action} while the job is {state}")]
    InvalidWorkflowTransition {
        /// What was requested.
        action: String,
        /// The current workflow state.
        state: String,
    },

    /// The command name is not known
    #[error("Unknown command: {name}")]
    UnknownCommand {
        /// The command name.
        name: String,
    },

    /// A command argument is missing or malformed
    #[error("Invalid argument for {command}: {reason}")]
    InvalidArgument {
        /// The command name.
        command: String,
        /// What was wrong.
        reason: String,
    },
}

/// Firmware error type
///
/// Conditions reported by the firmware or inferred from its traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    /// `error:N` response to a sent line
    #[error("error:{code} ({message})")]
    Error {
        /// Firmware error code.
        code: u8,
        /// Human readable description.
        message: String,
    },

    /// `ALARM:N` report
    #[error("ALARM:{code} ({message})")]
    Alarm {
        /// Firmware alarm code.
        code: u8,
        /// Human readable description.
        message: String,
    },

    /// Unsolicited acknowledgment or acknowledgment timeout
    #[error("Protocol desync: {reason}")]
    ProtocolDesync {
        /// What was observed.
        reason: String,
    },
}

/// Main error type for gcodemux
///
/// A unified error type that can represent any error from all layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Firmware error
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a port ownership conflict
    pub fn is_port_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError::PortUnavailable { .. })
        )
    }

    /// Check if this is a controller error
    pub fn is_controller_error(&self) -> bool {
        matches!(self, Error::Controller(_))
    }

    /// Check if this is a firmware error
    pub fn is_firmware_error(&self) -> bool {
        matches!(self, Error::Firmware(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
