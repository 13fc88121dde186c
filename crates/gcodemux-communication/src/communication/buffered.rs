//! Streaming sender with flow control and acknowledgment tracking
//!
//! Implements GRBL character-counting streaming: a line is released only when
//! it fits into what is left of the firmware receive buffer, and every `ok` or
//! `error` retires exactly the oldest released line.
//!
//! Two FIFO lanes feed one ledger:
//! - the immediate lane (operator lines, unlock, engine queries)
//! - the job lane (the loaded program), which can be paused on its own
//!
//! The sender never touches the device. It hands out [`Released`] lines for
//! the caller to write and is told about acknowledgments in arrival order.

use gcodemux_core::{ControllerError, ControllerType, FirmwareError, SenderStatus, WriteContext};
use gcodemux_settings::StreamingSettings;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Which queue a line was submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Operator and engine lines; never paused
    Immediate,
    /// Lines of the loaded program
    Job,
}

/// One line bound for the firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingCommand {
    /// Line text without terminator
    pub line: String,
    /// Who submitted it
    pub context: WriteContext,
}

impl OutgoingCommand {
    /// Create a command
    pub fn new(line: impl Into<String>, context: WriteContext) -> Self {
        Self {
            line: line.into(),
            context,
        }
    }

    /// Bytes the line occupies in the firmware buffer, terminator included
    pub fn wire_len(&self) -> usize {
        self.line.len() + 1
    }

    /// The bytes written to the device
    pub fn to_wire(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.wire_len());
        bytes.extend_from_slice(self.line.as_bytes());
        bytes.push(b'\n');
        bytes
    }
}

/// A line leaving a queue, or leaving the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    /// The line
    pub command: OutgoingCommand,
    /// The lane it came from
    pub lane: Lane,
}

/// A line retired by an acknowledgment
pub type Retired = Released;

/// Limits of one sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingConfig {
    /// Firmware receive buffer size in bytes
    pub capacity: usize,
    /// Maximum unsent lines across both lanes
    pub max_queued_lines: usize,
    /// How long the oldest in-flight line may wait for its acknowledgment
    pub ack_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            max_queued_lines: 1_000_000,
            ack_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamingConfig {
    /// Limits for a dialect under the given settings
    pub fn from_settings(settings: &StreamingSettings, controller_type: ControllerType) -> Self {
        Self {
            capacity: settings.rx_buffer_size_for(controller_type),
            max_queued_lines: settings.max_queued_lines,
            ack_timeout: settings.ack_timeout(),
        }
    }
}

/// Per-connection queues and bytes-in-flight ledger
#[derive(Debug)]
pub struct StreamingSender {
    config: StreamingConfig,
    immediate: VecDeque<OutgoingCommand>,
    job: VecDeque<OutgoingCommand>,
    in_flight: VecDeque<Released>,
    bytes_in_flight: usize,
    job_paused: bool,
    desynchronized: bool,
    /// Start of the oldest in-flight line's acknowledgment window
    ack_window_start: Option<Instant>,
    suspended_since: Option<Instant>,
}

impl StreamingSender {
    /// Create an empty sender
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            immediate: VecDeque::new(),
            job: VecDeque::new(),
            in_flight: VecDeque::new(),
            bytes_in_flight: 0,
            job_paused: false,
            desynchronized: false,
            ack_window_start: None,
            suspended_since: None,
        }
    }

    /// Firmware receive buffer size
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Bytes sent but not yet acknowledged
    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    /// Lines sent but not yet acknowledged
    pub fn lines_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Lines of one lane sent but not yet acknowledged
    pub fn lines_in_flight_from(&self, lane: Lane) -> usize {
        self.in_flight.iter().filter(|r| r.lane == lane).count()
    }

    /// Unsent lines in a lane
    pub fn queued(&self, lane: Lane) -> usize {
        self.queue(lane).len()
    }

    /// Whether the job lane is held
    pub fn is_paused(&self) -> bool {
        self.job_paused
    }

    /// Whether byte accounting has been declared untrustworthy
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// Check that a line could ever be sent
    pub fn validate(&self, command: &OutgoingCommand) -> Result<(), ControllerError> {
        if command.line.contains('\n') || command.line.contains('\r') {
            return Err(ControllerError::InvalidArgument {
                command: "write".to_string(),
                reason: "line contains a line terminator".to_string(),
            });
        }
        if command.wire_len() > self.config.capacity {
            return Err(ControllerError::LineTooLong {
                length: command.wire_len(),
                capacity: self.config.capacity,
            });
        }
        Ok(())
    }

    /// Append a line to a lane
    pub fn enqueue(&mut self, lane: Lane, command: OutgoingCommand) -> Result<(), ControllerError> {
        self.enqueue_all(lane, vec![command])
    }

    /// Append several lines to a lane; either all are accepted or none
    pub fn enqueue_all(
        &mut self,
        lane: Lane,
        commands: Vec<OutgoingCommand>,
    ) -> Result<(), ControllerError> {
        if self.desynchronized {
            return Err(ControllerError::Desynchronized);
        }
        for command in &commands {
            self.validate(command)?;
        }

        let queued = self.immediate.len() + self.job.len();
        if queued + commands.len() > self.config.max_queued_lines {
            return Err(ControllerError::QueueFull {
                limit: self.config.max_queued_lines,
            });
        }

        self.queue_mut(lane).extend(commands);
        Ok(())
    }

    /// Release every line that fits, immediate lane first
    ///
    /// A head that does not fit blocks its lane; the job lane is never
    /// allowed to overtake a waiting immediate line.
    pub fn release(&mut self, now: Instant) -> Vec<Released> {
        let mut released = Vec::new();
        if self.desynchronized {
            return released;
        }

        while let Some(lane) = self.next_lane() {
            let fits = self
                .queue(lane)
                .front()
                .is_some_and(|c| self.bytes_in_flight + c.wire_len() <= self.config.capacity);
            if !fits {
                break;
            }
            let Some(command) = self.queue_mut(lane).pop_front() else {
                break;
            };

            self.bytes_in_flight += command.wire_len();
            if self.in_flight.is_empty() {
                self.ack_window_start = Some(now);
            }
            let entry = Released { command, lane };
            self.in_flight.push_back(entry.clone());
            released.push(entry);
        }

        released
    }

    /// Retire the oldest in-flight line
    ///
    /// An acknowledgment with nothing in flight leaves the ledger untouched
    /// and is reported as a desync.
    pub fn on_acknowledge(&mut self, now: Instant) -> Result<Retired, FirmwareError> {
        let Some(entry) = self.in_flight.pop_front() else {
            return Err(FirmwareError::ProtocolDesync {
                reason: "acknowledgment with no command in flight".to_string(),
            });
        };

        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(entry.command.wire_len());
        self.ack_window_start = if self.in_flight.is_empty() {
            None
        } else {
            Some(now)
        };

        Ok(entry)
    }

    /// Hold the job lane
    pub fn pause(&mut self) {
        self.job_paused = true;
    }

    /// Release the job lane
    pub fn resume(&mut self) {
        self.job_paused = false;
    }

    /// Drop every unsent line; returns how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.immediate.len() + self.job.len();
        self.immediate.clear();
        self.job.clear();
        dropped
    }

    /// Drop unsent job lines only
    pub fn clear_job(&mut self) -> usize {
        let dropped = self.job.len();
        self.job.clear();
        dropped
    }

    /// Forget everything in flight
    ///
    /// Only valid when the firmware buffer is known to be empty (reset,
    /// disconnect). Clears the desync flag.
    pub fn reset_ledger(&mut self) -> Vec<Released> {
        let discarded: Vec<Released> = self.in_flight.drain(..).collect();
        self.bytes_in_flight = 0;
        self.desynchronized = false;
        self.ack_window_start = None;
        discarded
    }

    /// Suspend or restart the acknowledgment clock
    ///
    /// Time spent in a feed hold or door state does not count against the
    /// oldest line.
    pub fn suspend_ack_clock(&mut self, suspended: bool, now: Instant) {
        match (suspended, self.suspended_since) {
            (true, None) => self.suspended_since = Some(now),
            (false, Some(since)) => {
                self.suspended_since = None;
                if let Some(start) = self.ack_window_start {
                    let held_from = start.max(since);
                    self.ack_window_start = Some(start + now.saturating_duration_since(held_from));
                }
            }
            _ => {}
        }
    }

    /// Restart the acknowledgment window of the oldest in-flight line
    ///
    /// Called on each status report showing motion: with the planner full
    /// the firmware withholds `ok` until a block completes, however long
    /// that block takes.
    pub fn extend_ack_window(&mut self, now: Instant) {
        if self.ack_window_start.is_some() {
            self.ack_window_start = Some(now);
        }
    }

    /// Declare the connection desynchronized if the oldest line timed out
    ///
    /// Returns the desync once; later calls return `None` until the ledger
    /// is reset.
    pub fn check_timeout(&mut self, now: Instant) -> Option<FirmwareError> {
        if self.desynchronized || self.suspended_since.is_some() {
            return None;
        }
        let start = self.ack_window_start?;
        if now.saturating_duration_since(start) < self.config.ack_timeout {
            return None;
        }
        let oldest = self.in_flight.front()?;

        self.desynchronized = true;
        Some(FirmwareError::ProtocolDesync {
            reason: format!(
                "no acknowledgment for '{}' within {} ms",
                oldest.command.line,
                self.config.ack_timeout.as_millis()
            ),
        })
    }

    /// Snapshot of the ledger and queues
    pub fn status(&self) -> SenderStatus {
        SenderStatus {
            capacity: self.config.capacity,
            bytes_in_flight: self.bytes_in_flight,
            lines_in_flight: self.in_flight.len(),
            queued_immediate: self.immediate.len(),
            queued_job: self.job.len(),
            paused: self.job_paused,
            desynchronized: self.desynchronized,
        }
    }

    fn next_lane(&self) -> Option<Lane> {
        if !self.immediate.is_empty() {
            Some(Lane::Immediate)
        } else if !self.job_paused && !self.job.is_empty() {
            Some(Lane::Job)
        } else {
            None
        }
    }

    fn queue(&self, lane: Lane) -> &VecDeque<OutgoingCommand> {
        match lane {
            Lane::Immediate => &self.immediate,
            Lane::Job => &self.job,
        }
    }

    fn queue_mut(&mut self, lane: Lane) -> &mut VecDeque<OutgoingCommand> {
        match lane {
            Lane::Immediate => &mut self.immediate,
            Lane::Job => &mut self.job,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(capacity: usize) -> StreamingSender {
        StreamingSender::new(StreamingConfig {
            capacity,
            max_queued_lines: 100,
            ack_timeout: Duration::from_secs(5),
        })
    }

    fn line(text: &str) -> OutgoingCommand {
        OutgoingCommand::new(text, WriteContext::engine())
    }

    #[test]
    fn test_greedy_packing() {
        let mut sender = sender(20);
        let now = Instant::now();
        for text in ["G0 X1", "G0 X2", "G0 X3", "G0 X4"] {
            sender.enqueue(Lane::Job, line(text)).unwrap();
        }

        // 6 bytes each on the wire; three fit into 20
        let released = sender.release(now);
        assert_eq!(released.len(), 3);
        assert_eq!(sender.bytes_in_flight(), 18);

        sender.on_acknowledge(now).unwrap();
        let released = sender.release(now);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].command.line, "G0 X4");
    }

    #[test]
    fn test_immediate_lane_first() {
        let mut sender = sender(128);
        sender.enqueue(Lane::Job, line("G1 X1")).unwrap();
        sender.enqueue(Lane::Immediate, line("$X")).unwrap();

        let released = sender.release(Instant::now());
        assert_eq!(released[0].command.line, "$X");
        assert_eq!(released[0].lane, Lane::Immediate);
        assert_eq!(released[1].lane, Lane::Job);
    }

    #[test]
    fn test_pause_holds_job_lane_only() {
        let mut sender = sender(128);
        sender.pause();
        sender.enqueue(Lane::Job, line("G1 X1")).unwrap();
        sender.enqueue(Lane::Immediate, line("$X")).unwrap();

        let released = sender.release(Instant::now());
        assert_eq!(released.len(), 1);
        assert_eq!(sender.queued(Lane::Job), 1);

        sender.resume();
        assert_eq!(sender.release(Instant::now()).len(), 1);
    }

    #[test]
    fn test_unsolicited_acknowledgment() {
        let mut sender = sender(128);
        let err = sender.on_acknowledge(Instant::now()).unwrap_err();
        assert!(matches!(err, FirmwareError::ProtocolDesync { .. }));
        assert_eq!(sender.bytes_in_flight(), 0);
    }

    #[test]
    fn test_clear_keeps_in_flight() {
        let mut sender = sender(10);
        for text in ["G0 X1", "G0 X2", "G0 X3"] {
            sender.enqueue(Lane::Job, line(text)).unwrap();
        }
        sender.release(Instant::now());
        assert_eq!(sender.clear(), 2);
        assert_eq!(sender.lines_in_flight(), 1);
        assert_eq!(sender.bytes_in_flight(), 6);
    }

    #[test]
    fn test_embedded_newline_rejected() {
        let mut sender = sender(128);
        assert!(sender.enqueue(Lane::Immediate, line("G0\nG1")).is_err());
    }

    #[test]
    fn test_enqueue_all_is_atomic() {
        let mut sender = sender(8);
        // "G0 X1000" is 9 bytes on the wire
        let result = sender.enqueue_all(Lane::Job, vec![line("G0"), line("G0 X1000")]);
        assert!(matches!(result, Err(ControllerError::LineTooLong { .. })));
        assert_eq!(sender.queued(Lane::Job), 0);
    }

    #[test]
    fn test_queue_limit() {
        let mut sender = StreamingSender::new(StreamingConfig {
            max_queued_lines: 2,
            ..Default::default()
        });
        sender.enqueue(Lane::Job, line("G0")).unwrap();
        sender.enqueue(Lane::Immediate, line("G0")).unwrap();
        assert_eq!(
            sender.enqueue(Lane::Job, line("G0")),
            Err(ControllerError::QueueFull { limit: 2 })
        );
    }

    #[test]
    fn test_timeout_declares_desync_once() {
        let mut sender = sender(128);
        let start = Instant::now();
        sender.enqueue(Lane::Job, line("G4 P10")).unwrap();
        sender.release(start);

        assert!(sender.check_timeout(start + Duration::from_secs(4)).is_none());
        assert!(sender.check_timeout(start + Duration::from_secs(5)).is_some());
        assert!(sender.is_desynchronized());
        assert!(sender.check_timeout(start + Duration::from_secs(9)).is_none());

        // Nothing moves until the ledger is reset
        assert_eq!(
            sender.enqueue(Lane::Immediate, line("$X")),
            Err(ControllerError::Desynchronized)
        );
        assert_eq!(sender.reset_ledger().len(), 1);
        assert!(!sender.is_desynchronized());
    }

    #[test]
    fn test_hold_suspends_timeout() {
        let mut sender = sender(128);
        let start = Instant::now();
        sender.enqueue(Lane::Job, line("G1 X10 F100")).unwrap();
        sender.release(start);

        sender.suspend_ack_clock(true, start + Duration::from_secs(1));
        assert!(sender.check_timeout(start + Duration::from_secs(60)).is_none());
        sender.suspend_ack_clock(false, start + Duration::from_secs(61));

        // One second counted before the hold, three after
        assert!(sender.check_timeout(start + Duration::from_secs(64)).is_none());
        assert!(sender.check_timeout(start + Duration::from_secs(65)).is_some());
    }

    #[test]
    fn test_motion_extends_window() {
        let mut sender = sender(128);
        let start = Instant::now();
        sender.enqueue(Lane::Job, line("G1 X500 F10")).unwrap();
        sender.release(start);

        for secs in [4, 8, 12] {
            sender.extend_ack_window(start + Duration::from_secs(secs));
        }
        assert!(sender.check_timeout(start + Duration::from_secs(16)).is_none());
        assert!(sender.check_timeout(start + Duration::from_secs(17)).is_some());
    }

    #[test]
    fn test_extend_without_in_flight_is_noop() {
        let mut sender = sender(128);
        let start = Instant::now();
        sender.extend_ack_window(start);
        sender.enqueue(Lane::Job, line("G1 X1")).unwrap();
        sender.release(start + Duration::from_secs(10));
        assert!(sender.check_timeout(start + Duration::from_secs(14)).is_none());
    }

    #[test]
    fn test_window_restarts_on_retirement() {
        let mut sender = sender(128);
        let start = Instant::now();
        sender.enqueue(Lane::Job, line("G1 X1")).unwrap();
        sender.enqueue(Lane::Job, line("G1 X2")).unwrap();
        sender.release(start);

        sender.on_acknowledge(start + Duration::from_secs(4)).unwrap();
        assert!(sender.check_timeout(start + Duration::from_secs(8)).is_none());
        assert!(sender.check_timeout(start + Duration::from_secs(9)).is_some());
    }
}
