//! # gcodemux Communication
//!
//! Serial transport, GRBL line protocol, streaming sender, per-device
//! connection tasks and the multiplexing [`Engine`] that lets several
//! clients share one controller.

pub mod communication;
pub mod connection;
pub mod engine;
pub mod firmware;

pub use communication::{
    list_ports, ConnectionParams, Lane, LinkEvent, OutgoingCommand, PortOpener, SerialLink,
    SerialParity, SerialPortInfo, SerialPortOpener, StreamingConfig, StreamingSender,
};
pub use connection::{ConnectionHandle, PortSnapshot};
pub use engine::{Engine, EventStream, OpenOptions};
pub use firmware::{ControllerCommand, ControllerType, Effect, GrblController, ParsedLine};
