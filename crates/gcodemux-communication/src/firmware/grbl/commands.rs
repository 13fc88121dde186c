//! GRBL command set
//!
//! Client commands arrive as a name plus positional JSON arguments
//! (`command(port, "feedOverride", [10])`) and are parsed into a
//! [`ControllerCommand`] before they reach the connection task.

use gcodemux_core::ControllerError;
use serde_json::Value;

/// Single-byte realtime commands; never queued, never acknowledged
pub mod realtime {
    /// `?` status report query
    pub const STATUS_REPORT: u8 = b'?';
    /// `~` cycle start / resume
    pub const CYCLE_START: u8 = b'~';
    /// `!` feed hold
    pub const FEED_HOLD: u8 = b'!';
    /// Ctrl-X soft reset
    pub const SOFT_RESET: u8 = 0x18;
    /// Cancel the active jog
    pub const JOG_CANCEL: u8 = 0x85;
    /// Feed override back to 100%
    pub const FEED_OV_RESET: u8 = 0x90;
    /// Feed override +10%
    pub const FEED_OV_COARSE_PLUS: u8 = 0x91;
    /// Feed override -10%
    pub const FEED_OV_COARSE_MINUS: u8 = 0x92;
    /// Feed override +1%
    pub const FEED_OV_FINE_PLUS: u8 = 0x93;
    /// Feed override -1%
    pub const FEED_OV_FINE_MINUS: u8 = 0x94;
    /// Rapid override 100%
    pub const RAPID_OV_RESET: u8 = 0x95;
    /// Rapid override 50%
    pub const RAPID_OV_MEDIUM: u8 = 0x96;
    /// Rapid override 25%
    pub const RAPID_OV_LOW: u8 = 0x97;
    /// Spindle override back to 100%
    pub const SPINDLE_OV_RESET: u8 = 0x99;
    /// Spindle override +10%
    pub const SPINDLE_OV_COARSE_PLUS: u8 = 0x9A;
    /// Spindle override -10%
    pub const SPINDLE_OV_COARSE_MINUS: u8 = 0x9B;
    /// Spindle override +1%
    pub const SPINDLE_OV_FINE_PLUS: u8 = 0x9C;
    /// Spindle override -1%
    pub const SPINDLE_OV_FINE_MINUS: u8 = 0x9D;

    /// Printable form for `serialport:write` echoes
    pub fn describe(byte: u8) -> String {
        if byte.is_ascii_graphic() {
            (byte as char).to_string()
        } else {
            format!("0x{:02X}", byte)
        }
    }
}

/// A parsed client command
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCommand {
    /// `gcode:load name text`
    Load { name: String, text: String },
    /// `gcode:unload`
    Unload,
    /// `gcode:start`
    Start,
    /// `gcode:pause`
    Pause,
    /// `gcode:resume`
    Resume,
    /// `gcode:stop [{"force": true}]`
    Stop { force: bool },
    /// `sender:clear`
    ClearQueue,
    /// `gcode text` (one or more lines, immediate lane)
    Gcode(Vec<String>),
    /// `feedhold`
    FeedHold,
    /// `cyclestart`
    CycleStart,
    /// `statusreport`
    StatusReport,
    /// `homing`
    Homing,
    /// `sleep`
    Sleep,
    /// `unlock`
    Unlock,
    /// `reset`
    Reset,
    /// `jog:cancel`
    JogCancel,
    /// `feedOverride delta` (-10, -1, 0, 1, 10)
    FeedOverride(i64),
    /// `spindleOverride delta` (-10, -1, 0, 1, 10)
    SpindleOverride(i64),
    /// `rapidOverride percent` (100, 50, 25)
    RapidOverride(u64),
}

impl ControllerCommand {
    /// Parse a command name and its arguments
    pub fn parse(name: &str, args: &[Value]) -> Result<Self, ControllerError> {
        let command = match name {
            "gcode:load" => Self::Load {
                name: string_arg(name, args, 0)?,
                text: string_arg(name, args, 1)?,
            },
            "gcode:unload" => Self::Unload,
            "gcode:start" => Self::Start,
            "gcode:pause" => Self::Pause,
            "gcode:resume" => Self::Resume,
            "gcode:stop" => Self::Stop {
                force: args
                    .first()
                    .and_then(|v| v.get("force"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "sender:clear" => Self::ClearQueue,
            "gcode" => Self::Gcode(split_lines(&string_arg(name, args, 0)?)),
            "feedhold" => Self::FeedHold,
            "cyclestart" => Self::CycleStart,
            "statusreport" => Self::StatusReport,
            "homing" => Self::Homing,
            "sleep" => Self::Sleep,
            "unlock" => Self::Unlock,
            "reset" => Self::Reset,
            "jog:cancel" => Self::JogCancel,
            "feedOverride" => Self::FeedOverride(int_arg(name, args)?),
            "spindleOverride" => Self::SpindleOverride(int_arg(name, args)?),
            "rapidOverride" => Self::RapidOverride(
                u64::try_from(int_arg(name, args)?).map_err(|_| invalid(name, "negative percent"))?,
            ),
            _ => {
                return Err(ControllerError::UnknownCommand {
                    name: name.to_string(),
                })
            }
        };

        command.realtime_byte()?;
        Ok(command)
    }

    /// The realtime byte this command writes, if it is a realtime command
    pub fn realtime_byte(&self) -> Result<Option<u8>, ControllerError> {
        use realtime::*;

        let byte = match self {
            Self::FeedHold => FEED_HOLD,
            Self::CycleStart => CYCLE_START,
            Self::StatusReport => STATUS_REPORT,
            Self::Reset => SOFT_RESET,
            Self::JogCancel => JOG_CANCEL,
            Self::FeedOverride(delta) => match *delta {
                0 => FEED_OV_RESET,
                10 => FEED_OV_COARSE_PLUS,
                -10 => FEED_OV_COARSE_MINUS,
                1 => FEED_OV_FINE_PLUS,
                -1 => FEED_OV_FINE_MINUS,
                _ => return Err(invalid("feedOverride", "delta must be -10, -1, 0, 1 or 10")),
            },
            Self::SpindleOverride(delta) => match *delta {
                0 => SPINDLE_OV_RESET,
                10 => SPINDLE_OV_COARSE_PLUS,
                -10 => SPINDLE_OV_COARSE_MINUS,
                1 => SPINDLE_OV_FINE_PLUS,
                -1 => SPINDLE_OV_FINE_MINUS,
                _ => {
                    return Err(invalid(
                        "spindleOverride",
                        "delta must be -10, -1, 0, 1 or 10",
                    ))
                }
            },
            Self::RapidOverride(percent) => match *percent {
                100 => RAPID_OV_RESET,
                50 => RAPID_OV_MEDIUM,
                25 => RAPID_OV_LOW,
                _ => return Err(invalid("rapidOverride", "percent must be 100, 50 or 25")),
            },
            _ => return Ok(None),
        };
        Ok(Some(byte))
    }

    /// The `$` system line this command queues, if any
    pub fn system_line(&self) -> Option<&'static str> {
        match self {
            Self::Homing => Some("$H"),
            Self::Sleep => Some("$SLP"),
            Self::Unlock => Some("$X"),
            _ => None,
        }
    }
}

/// Split text into streamable lines
///
/// Drops blank lines and full-line `;` or `( )` comments; trims the rest.
pub fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with(';'))
        .filter(|line| !(line.starts_with('(') && line.ends_with(')')))
        .map(str::to_string)
        .collect()
}

fn invalid(command: &str, reason: &str) -> ControllerError {
    ControllerError::InvalidArgument {
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

fn string_arg(command: &str, args: &[Value], index: usize) -> Result<String, ControllerError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid(command, &format!("argument {} must be a string", index)))
}

fn int_arg(command: &str, args: &[Value]) -> Result<i64, ControllerError> {
    args.first()
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(command, "argument 0 must be an integer"))
}
