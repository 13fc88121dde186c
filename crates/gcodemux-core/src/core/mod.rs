//! Engine-facing event types

pub mod event;

pub use event::{ClientId, CommandSource, EngineEvent, HaltCode, HaltReason, WriteContext};
