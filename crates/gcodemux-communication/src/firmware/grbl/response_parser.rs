//! GRBL Response Parser
//!
//! Classifies one raw firmware line into a [`ParsedLine`]. The parser is an
//! ordered list of independent matchers; the first match wins, and a line no
//! matcher accepts comes back as [`ParsedLine::Unrecognized`] so raw traffic
//! is never dropped.

use super::status_parser::{StatusParser, StatusReport};
use gcodemux_core::ModalState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One classified firmware line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParsedLine {
    /// `ok`
    Ok,
    /// `error:N`; legacy text errors carry code 0
    Error(u8),
    /// `ALARM:N`; legacy text alarms carry code 0
    Alarm(u8),
    /// `[echo:...]`
    Echo(String),
    /// `<...>` realtime status report
    Status(StatusReport),
    /// `[GC:...]` modal state
    ParserState(ModalState),
    /// `[G54:...]`, `[TLO:...]`, `[PRB:...]` and friends
    Parameter { name: String, value: String },
    /// `[MSG:...]` and other bracketed messages
    Feedback(String),
    /// `$n=value`
    Setting { number: u16, value: String },
    /// Startup banner (`Grbl 1.1h ['$' for help]`)
    Startup { version: String },
    /// Anything else, verbatim
    Unrecognized(String),
}

impl fmt::Display for ParsedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error(code) => write!(f, "error:{}", code),
            Self::Alarm(code) => write!(f, "ALARM:{}", code),
            Self::Echo(text) => write!(f, "echo:{}", text),
            Self::Status(report) => write!(f, "status:{}", report.state_word),
            Self::ParserState(_) => write!(f, "parser_state"),
            Self::Parameter { name, value } => write!(f, "parameter:{}={}", name, value),
            Self::Feedback(text) => write!(f, "feedback:{}", text),
            Self::Setting { number, value } => write!(f, "setting:${}={}", number, value),
            Self::Startup { version } => write!(f, "startup:{}", version),
            Self::Unrecognized(raw) => write!(f, "unrecognized:{}", raw),
        }
    }
}

type Matcher = fn(&str) -> Option<ParsedLine>;

const MATCHERS: &[Matcher] = &[
    match_alarm,
    match_error,
    match_echo,
    match_status,
    match_ok,
    match_parser_state,
    match_parameter,
    match_feedback,
    match_setting,
    match_startup,
];

const PARAMETER_NAMES: &[&str] = &[
    "G54", "G55", "G56", "G57", "G58", "G59", "G28", "G30", "G92", "TLO", "PRB",
];

/// Classify one line
pub fn parse_line(raw: &str) -> ParsedLine {
    let line = raw.trim();
    MATCHERS
        .iter()
        .find_map(|matcher| matcher(line))
        .unwrap_or_else(|| ParsedLine::Unrecognized(line.to_string()))
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

fn bracketed(line: &str) -> Option<&str> {
    line.strip_prefix('[')?.strip_suffix(']')
}

fn match_alarm(line: &str) -> Option<ParsedLine> {
    let rest = strip_prefix_ignore_case(line, "ALARM:")?;
    Some(ParsedLine::Alarm(rest.trim().parse().unwrap_or(0)))
}

fn match_error(line: &str) -> Option<ParsedLine> {
    let rest = strip_prefix_ignore_case(line, "error:")?;
    Some(ParsedLine::Error(rest.trim().parse().unwrap_or(0)))
}

fn match_echo(line: &str) -> Option<ParsedLine> {
    let text = bracketed(line)?.strip_prefix("echo:")?;
    Some(ParsedLine::Echo(text.to_string()))
}

fn match_status(line: &str) -> Option<ParsedLine> {
    if line.len() > 2 && line.starts_with('<') && line.ends_with('>') {
        Some(ParsedLine::Status(StatusParser::parse_full(line)))
    } else {
        None
    }
}

fn match_ok(line: &str) -> Option<ParsedLine> {
    (line == "ok").then_some(ParsedLine::Ok)
}

fn match_parser_state(line: &str) -> Option<ParsedLine> {
    let words = bracketed(line)?.strip_prefix("GC:")?;
    Some(ParsedLine::ParserState(parse_modal(words)))
}

fn match_parameter(line: &str) -> Option<ParsedLine> {
    let (name, value) = bracketed(line)?.split_once(':')?;
    PARAMETER_NAMES.contains(&name).then(|| ParsedLine::Parameter {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn match_feedback(line: &str) -> Option<ParsedLine> {
    let inner = bracketed(line)?;
    let text = inner.strip_prefix("MSG:").unwrap_or(inner);
    Some(ParsedLine::Feedback(text.to_string()))
}

fn match_setting(line: &str) -> Option<ParsedLine> {
    let (number, value) = line.strip_prefix('$')?.split_once('=')?;
    let number = number.parse().ok()?;
    Some(ParsedLine::Setting {
        number,
        value: value.to_string(),
    })
}

fn match_startup(line: &str) -> Option<ParsedLine> {
    let mut words = line.split_whitespace();
    let name = words.next()?;
    if !name.eq_ignore_ascii_case("grbl") && !name.eq_ignore_ascii_case("grblhal") {
        return None;
    }
    let version = words.next()?;
    version
        .starts_with(|c: char| c.is_ascii_digit())
        .then(|| ParsedLine::Startup {
            version: version.to_string(),
        })
}

/// Parse the words of a `[GC:...]` report
pub fn parse_modal(words: &str) -> ModalState {
    let mut modal = ModalState::default();

    for word in words.split_whitespace() {
        let slot = match word {
            "G0" | "G1" | "G2" | "G3" | "G38.2" | "G38.3" | "G38.4" | "G38.5" | "G80" => {
                &mut modal.motion
            }
            "G54" | "G55" | "G56" | "G57" | "G58" | "G59" => &mut modal.wcs,
            "G17" | "G18" | "G19" => &mut modal.plane,
            "G20" | "G21" => &mut modal.units,
            "G90" | "G91" => &mut modal.distance,
            "G93" | "G94" => &mut modal.feed_rate_mode,
            "M0" | "M1" | "M2" | "M30" => &mut modal.program,
            "M3" | "M4" | "M5" => &mut modal.spindle,
            "M7" | "M8" | "M9" => {
                modal.coolant.push(word.to_string());
                continue;
            }
            _ => {
                if let Some(tool) = word.strip_prefix('T') {
                    modal.tool = tool.parse().ok();
                } else if let Some(feed) = word.strip_prefix('F') {
                    modal.feed_rate = feed.parse().ok();
                } else if let Some(speed) = word.strip_prefix('S') {
                    modal.spindle_speed = speed.parse().ok();
                }
                continue;
            }
        };
        *slot = Some(word.to_string());
    }

    modal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_before_error() {
        assert_eq!(parse_line("alarm:2"), ParsedLine::Alarm(2));
        assert_eq!(parse_line("ALARM:Hard limit"), ParsedLine::Alarm(0));
    }

    #[test]
    fn test_echo_is_not_feedback() {
        assert_eq!(parse_line("[echo:G1X1]"), ParsedLine::Echo("G1X1".into()));
        assert_eq!(parse_line("[MSG:Caution: Unlocked]"), ParsedLine::Feedback("Caution: Unlocked".into()));
    }

    #[test]
    fn test_empty_line() {
        assert_eq!(parse_line("\r"), ParsedLine::Unrecognized(String::new()));
    }
}
