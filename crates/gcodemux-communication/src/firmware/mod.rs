//! Firmware implementations
//!
//! Only the GRBL family is supported; grblHAL differs in its receive buffer
//! size, which [`ControllerType`] carries.

pub mod grbl;

pub use gcodemux_core::ControllerType;
pub use grbl::{ControllerCommand, Effect, GrblController, ParsedLine};
