//! GRBL Firmware Support
//!
//! GRBL 1.1 and grblHAL speak the same line protocol: newline-terminated
//! command lines acknowledged by `ok`/`error:N` in order, plus single-byte
//! realtime commands that are never acknowledged.

pub mod commands;
pub mod controller;
pub mod error_decoder;
pub mod response_parser;
pub mod status_parser;

pub use commands::{realtime, split_lines, ControllerCommand};
pub use controller::{Effect, GrblController};
pub use error_decoder::{alarm_message, error_message, firmware_alarm, firmware_error};
pub use response_parser::{parse_line, parse_modal, ParsedLine};
pub use status_parser::{StatusParser, StatusReport};
