//! # gcodemux Core
//!
//! Core types for the gcodemux controller communication engine.
//! Provides the error taxonomy, the mirrored machine status, job progress
//! and the typed events broadcast to attached clients.

pub mod core;
pub mod data;
pub mod error;

pub use core::{ClientId, CommandSource, EngineEvent, HaltCode, HaltReason, WriteContext};

pub use data::{
    BufferState, CNCPoint, ControllerState, ControllerType, JobStatus, MachineStatus, ModalState,
    OverrideState, SenderStatus, Units, WorkflowState,
};

pub use error::{ConnectionError, ControllerError, Error, FirmwareError, Result};
