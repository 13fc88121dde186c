//! GRBL Status Report Parsing
//!
//! Parses the body of a GRBL 1.1 realtime status report
//! (`<Idle|MPos:0.000,0.000,0.000|FS:0,0|WCO:0.000,0.000,0.000>`) into its
//! fields. Fields are matched by exact prefix; a field that fails to parse is
//! left absent rather than failing the whole report.

use gcodemux_core::{BufferState, CNCPoint, ControllerState, OverrideState};
use serde::{Deserialize, Serialize};

/// One parsed status report
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusReport {
    /// The raw state word (`Idle`, `Hold`, ...)
    pub state_word: String,
    /// Parsed state; `None` for words this dialect does not know
    pub state: Option<ControllerState>,
    /// Sub-state code (`Hold:1`, `Door:0`)
    pub sub_state: Option<u8>,
    /// `MPos:` field
    pub machine_position: Option<CNCPoint>,
    /// `WPos:` field
    pub work_position: Option<CNCPoint>,
    /// `WCO:` field (sent only every few reports)
    pub work_coordinate_offset: Option<CNCPoint>,
    /// `F:` or first value of `FS:`
    pub feed_rate: Option<f64>,
    /// Second value of `FS:`
    pub spindle_speed: Option<f64>,
    /// `Ov:` field
    pub overrides: Option<OverrideState>,
    /// `Bf:` (1.1) or `Buf:` field
    pub buffer: Option<BufferState>,
    /// `Pn:` field
    pub pins: Option<String>,
    /// `Ln:` field
    pub line_number: Option<u32>,
}

/// Comprehensive status parsing
pub struct StatusParser;

impl StatusParser {
    /// Parse a status report, with or without its angle brackets
    pub fn parse_full(status_line: &str) -> StatusReport {
        let body = status_line
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>');
        let mut fields = body.split('|');

        let mut report = StatusReport::default();
        if let Some(head) = fields.next() {
            let (word, sub) = match head.split_once(':') {
                Some((word, sub)) => (word, sub.parse::<u8>().ok()),
                None => (head, None),
            };
            report.state_word = word.to_string();
            report.state = ControllerState::from_grbl(word);
            report.sub_state = sub;
        }

        for field in fields {
            let Some((name, value)) = field.split_once(':') else {
                continue;
            };
            match name {
                "MPos" => report.machine_position = parse_point(value),
                "WPos" => report.work_position = parse_point(value),
                "WCO" => report.work_coordinate_offset = parse_point(value),
                "F" => report.feed_rate = value.trim().parse().ok(),
                "FS" => {
                    let mut parts = value.split(',');
                    report.feed_rate = parts.next().and_then(|v| v.trim().parse().ok());
                    report.spindle_speed = parts.next().and_then(|v| v.trim().parse().ok());
                }
                "Ov" => report.overrides = parse_overrides(value),
                "Bf" | "Buf" => report.buffer = parse_buffer(value),
                "Pn" => report.pins = Some(value.to_string()),
                "Ln" => report.line_number = value.trim().parse().ok(),
                _ => {}
            }
        }

        report
    }

    /// Derive WorkPosition from MachinePosition and WorkCoordinateOffset
    /// WPos = MPos - WCO
    pub fn wpos_from_mpos_wco(mpos: &CNCPoint, wco: &CNCPoint) -> CNCPoint {
        mpos.subtract(wco)
    }

    /// MPos = WPos + WCO
    pub fn mpos_from_wpos_wco(wpos: &CNCPoint, wco: &CNCPoint) -> CNCPoint {
        wpos.add(wco)
    }

    /// Resolve both coordinate spaces
    ///
    /// GRBL reports either `MPos` or `WPos` depending on `$10`; the missing
    /// one is derived from the offset in this report or the last known one.
    pub fn resolve_positions(
        report: &StatusReport,
        known_wco: Option<&CNCPoint>,
    ) -> (Option<CNCPoint>, Option<CNCPoint>) {
        let wco = report.work_coordinate_offset.as_ref().or(known_wco);
        match (report.machine_position, report.work_position, wco) {
            (Some(mpos), None, Some(wco)) => {
                (Some(mpos), Some(Self::wpos_from_mpos_wco(&mpos, wco)))
            }
            (None, Some(wpos), Some(wco)) => {
                (Some(Self::mpos_from_wpos_wco(&wpos, wco)), Some(wpos))
            }
            (mpos, wpos, _) => (mpos, wpos),
        }
    }
}

fn parse_point(value: &str) -> Option<CNCPoint> {
    let coords: Vec<f64> = value
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;

    if coords.len() < 3 {
        return None;
    }
    Some(CNCPoint::from_axes(&coords))
}

fn parse_overrides(value: &str) -> Option<OverrideState> {
    let parts: Vec<u16> = value
        .split(',')
        .map(|s| s.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .ok()?;

    match parts.as_slice() {
        [feed, rapid, spindle, ..] => Some(OverrideState {
            feed: *feed,
            rapid: *rapid,
            spindle: *spindle,
        }),
        _ => None,
    }
}

fn parse_buffer(value: &str) -> Option<BufferState> {
    let (planner, rx) = value.split_once(',').or_else(|| value.split_once(':'))?;
    Some(BufferState {
        planner: planner.trim().parse().ok()?,
        rx: rx.trim().parse().ok()?,
    })
}
