//! GRBL Controller Implementation
//!
//! [`GrblController`] is the response dispatcher of one physical connection.
//! It owns the mirrored [`MachineStatus`], the [`StreamingSender`] and the
//! loaded job, and is driven by the connection task: firmware lines, client
//! commands and timer ticks go in, [`Effect`]s come out. It performs no I/O,
//! so every transition can be exercised without a device.

use super::commands::{realtime, split_lines, ControllerCommand};
use super::error_decoder::{firmware_alarm, firmware_error};
use super::response_parser::{parse_line, ParsedLine};
use super::status_parser::{StatusParser, StatusReport};
use crate::communication::{Lane, OutgoingCommand, Retired, StreamingConfig, StreamingSender};
use chrono::Utc;
use gcodemux_core::{
    ClientId, ControllerError, ControllerState, ControllerType, EngineEvent, FirmwareError,
    HaltReason, JobStatus, MachineStatus, SenderStatus, WorkflowState, WriteContext,
};
use gcodemux_settings::{ErrorAction, ErrorPolicy, StreamingSettings};
use tokio::time::Instant;

/// Queries issued after the firmware announces itself
const STARTUP_QUERIES: &[&str] = &["$$", "$#", "$G"];

/// Something the connection task must do on the controller's behalf
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write bytes to the device
    Write {
        /// Raw bytes, terminator included for lines
        data: Vec<u8>,
        /// Attribution for the `serialport:write` echo
        context: WriteContext,
        /// Text of the `serialport:write` echo; `None` writes silently
        echo: Option<String>,
    },
    /// Broadcast an event to every attached client
    Emit(EngineEvent),
}

impl Effect {
    fn line(command: &OutgoingCommand) -> Self {
        Self::Write {
            data: command.to_wire(),
            context: command.context,
            echo: Some(command.line.clone()),
        }
    }

    fn realtime(byte: u8, context: WriteContext) -> Self {
        Self::Write {
            data: vec![byte],
            context,
            echo: Some(realtime::describe(byte)),
        }
    }
}

#[derive(Debug, Clone)]
struct Job {
    status: JobStatus,
    lines: Vec<String>,
}

/// Response dispatcher and job workflow of one connection
#[derive(Debug)]
pub struct GrblController {
    port: String,
    baud_rate: u32,
    controller_type: ControllerType,
    status: MachineStatus,
    sender: StreamingSender,
    job: Option<Job>,
    workflow: WorkflowState,
    error_policy: ErrorPolicy,
    /// Job lines of an earlier run still awaiting acknowledgment
    stale_job_lines: usize,
    settings_dirty: bool,
    last_status: Option<MachineStatus>,
    last_sender: Option<(SenderStatus, Option<JobStatus>)>,
}

impl GrblController {
    /// Create a controller for a freshly opened port
    pub fn new(
        port: impl Into<String>,
        baud_rate: u32,
        controller_type: ControllerType,
        settings: &StreamingSettings,
    ) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            controller_type,
            status: MachineStatus::connecting(),
            sender: StreamingSender::new(StreamingConfig::from_settings(settings, controller_type)),
            job: None,
            workflow: WorkflowState::Idle,
            error_policy: settings.error_policy.clone(),
            stale_job_lines: 0,
            settings_dirty: false,
            last_status: None,
            last_sender: None,
        }
    }

    /// Device path
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Baud rate the port was opened at
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Firmware dialect
    pub fn controller_type(&self) -> ControllerType {
        self.controller_type
    }

    /// The mirrored machine status
    pub fn status(&self) -> &MachineStatus {
        &self.status
    }

    /// The streaming sender
    pub fn sender(&self) -> &StreamingSender {
        &self.sender
    }

    /// Job workflow state
    pub fn workflow(&self) -> WorkflowState {
        self.workflow
    }

    /// Metadata of the loaded job
    pub fn job(&self) -> Option<&JobStatus> {
        self.job.as_ref().map(|job| &job.status)
    }

    /// Events that bring a newly attached client up to date
    ///
    /// Produces no writes and changes nothing.
    pub fn attach_events(&self, in_use: bool) -> Vec<EngineEvent> {
        vec![
            EngineEvent::SerialPortOpen {
                port: self.port.clone(),
                baud_rate: self.baud_rate,
                controller_type: self.controller_type.to_string(),
                in_use,
            },
            EngineEvent::ControllerStatus {
                port: self.port.clone(),
                status: Box::new(self.status.clone()),
            },
            self.settings_event(),
            EngineEvent::SenderStatus {
                port: self.port.clone(),
                status: self.sender.status(),
                job: self.job().cloned(),
            },
            EngineEvent::WorkflowState {
                port: self.port.clone(),
                state: self.workflow,
            },
        ]
    }

    /// Fold one raw firmware line into the controller
    pub fn handle_line(&mut self, raw: &str, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if raw.trim().is_empty() {
            return effects;
        }

        effects.push(self.emit(EngineEvent::SerialPortRead {
            port: self.port.clone(),
            line: raw.to_string(),
        }));

        let parsed = parse_line(raw);
        tracing::debug!("[{}] < {}", self.port, parsed);

        match parsed {
            ParsedLine::Ok => self.on_ok(now, &mut effects),
            ParsedLine::Error(code) => self.on_error(code, now, &mut effects),
            ParsedLine::Alarm(code) => self.on_alarm(code, &mut effects),
            ParsedLine::Status(report) => self.apply_status(&report, now),
            ParsedLine::ParserState(modal) => self.status.modal = modal,
            ParsedLine::Parameter { name, value } => {
                self.status.parameters.insert(name, value);
            }
            ParsedLine::Setting { number, value } => {
                self.status.settings.insert(number, value);
                self.settings_dirty = true;
                // `$$` dumps dozens of lines; state goes out with the next ok
                return effects;
            }
            ParsedLine::Startup { version } => self.on_startup(version, now, &mut effects),
            ParsedLine::Feedback(text) => tracing::info!("[{}] {}", self.port, text),
            ParsedLine::Echo(_) => {}
            ParsedLine::Unrecognized(line) => {
                tracing::debug!("[{}] Unrecognized line: {}", self.port, line)
            }
        }

        self.flush_changes(&mut effects);
        effects
    }

    /// Execute a parsed client command
    pub fn handle_command(
        &mut self,
        command: ControllerCommand,
        client: ClientId,
        now: Instant,
    ) -> Result<Vec<Effect>, ControllerError> {
        let mut effects = Vec::new();
        let context = WriteContext::client(client);

        match command {
            ControllerCommand::Load { name, text } => self.load(name, &text, &mut effects)?,
            ControllerCommand::Unload => {
                self.ensure_not_streaming("unload")?;
                self.sender.clear_job();
                self.job = None;
                self.set_workflow(WorkflowState::Idle, &mut effects);
            }
            ControllerCommand::Start => self.start(client, now, &mut effects)?,
            ControllerCommand::Pause => {
                if self.workflow != WorkflowState::Running {
                    return Err(self.transition_error("pause"));
                }
                self.sender.pause();
                effects.push(Effect::realtime(realtime::FEED_HOLD, context));
                self.set_workflow(WorkflowState::Paused, &mut effects);
            }
            ControllerCommand::Resume => {
                if !matches!(self.workflow, WorkflowState::Paused | WorkflowState::Halted) {
                    return Err(self.transition_error("resume"));
                }
                self.ensure_ready()?;
                self.sender.resume();
                effects.push(Effect::realtime(realtime::CYCLE_START, context));
                self.set_workflow(WorkflowState::Running, &mut effects);
                self.finish_if_complete(&mut effects);
            }
            ControllerCommand::Stop { force } => {
                self.stop_job(&mut effects);
                if force {
                    self.soft_reset(context, &mut effects);
                }
            }
            ControllerCommand::ClearQueue => {
                let dropped = self.sender.clear();
                tracing::info!("[{}] Cleared {} queued lines", self.port, dropped);
                self.stop_job(&mut effects);
            }
            ControllerCommand::Gcode(lines) => {
                if lines.is_empty() {
                    return Err(ControllerError::InvalidArgument {
                        command: "gcode".to_string(),
                        reason: "no lines to send".to_string(),
                    });
                }
                self.enqueue_immediate(lines, context)?;
            }
            ControllerCommand::Reset => self.soft_reset(context, &mut effects),
            other => {
                if let Some(line) = other.system_line() {
                    self.enqueue_immediate(vec![line.to_string()], context)?;
                } else if let Some(byte) = other.realtime_byte()? {
                    effects.push(Effect::realtime(byte, context));
                }
            }
        }

        self.pump(now, &mut effects);
        self.flush_changes(&mut effects);
        Ok(effects)
    }

    /// Queue raw text from a client on the immediate lane
    ///
    /// Text holding several lines is split; a lone `?`, `!` or `~` is sent
    /// as a realtime byte instead of a line.
    pub fn handle_write(
        &mut self,
        text: &str,
        context: WriteContext,
        now: Instant,
    ) -> Result<Vec<Effect>, ControllerError> {
        let mut effects = Vec::new();

        match text.trim() {
            "?" => effects.push(Effect::realtime(realtime::STATUS_REPORT, context)),
            "!" => effects.push(Effect::realtime(realtime::FEED_HOLD, context)),
            "~" => effects.push(Effect::realtime(realtime::CYCLE_START, context)),
            _ => {
                let lines: Vec<String> = text
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                if lines.is_empty() {
                    return Ok(effects);
                }
                self.enqueue_immediate(lines, context)?;
            }
        }

        self.pump(now, &mut effects);
        self.flush_changes(&mut effects);
        Ok(effects)
    }

    /// Periodic work: acknowledgment deadline and status poll
    pub fn on_tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        if let Some(err) = self.sender.check_timeout(now) {
            tracing::warn!("[{}] {}", self.port, err);
            self.halt(HaltReason::from(&err), &mut effects);
        }

        if self.status.state != ControllerState::Disconnected {
            effects.push(Effect::Write {
                data: vec![realtime::STATUS_REPORT],
                context: WriteContext::engine(),
                echo: None,
            });
        }

        self.flush_changes(&mut effects);
        effects
    }

    /// The device went away or the port is being closed
    ///
    /// In-flight lines are discarded without resending and a streaming job
    /// is halted with a transport reason.
    pub fn on_disconnect(&mut self, message: &str) -> Vec<Effect> {
        let mut effects = Vec::new();

        let discarded = self.sender.reset_ledger();
        self.sender.clear();
        self.stale_job_lines = 0;
        if !discarded.is_empty() {
            tracing::warn!(
                "[{}] Discarded {} unacknowledged lines",
                self.port,
                discarded.len()
            );
        }

        if self.is_streaming() || !discarded.is_empty() {
            self.halt(HaltReason::transport(message), &mut effects);
        }

        self.status.state = ControllerState::Disconnected;
        self.status.sub_state = None;
        self.flush_changes(&mut effects);
        effects
    }

    fn emit(&self, event: EngineEvent) -> Effect {
        Effect::Emit(event)
    }

    fn settings_event(&self) -> EngineEvent {
        EngineEvent::ControllerSettings {
            port: self.port.clone(),
            firmware_version: self.status.firmware_version.clone(),
            settings: self.status.settings.clone(),
        }
    }

    fn is_streaming(&self) -> bool {
        matches!(self.workflow, WorkflowState::Running | WorkflowState::Paused)
    }

    fn transition_error(&self, action: &str) -> ControllerError {
        ControllerError::InvalidWorkflowTransition {
            action: action.to_string(),
            state: self.workflow.to_string(),
        }
    }

    fn ensure_not_streaming(&self, action: &str) -> Result<(), ControllerError> {
        if self.is_streaming() {
            return Err(self.transition_error(action));
        }
        Ok(())
    }

    /// Connected, not in alarm and not desynchronized
    fn ensure_ready(&self) -> Result<(), ControllerError> {
        if !self.status.state.is_connected() {
            return Err(ControllerError::NotConnected);
        }
        if let Some(code) = self.status.alarm {
            return Err(ControllerError::AlarmActive { code });
        }
        if self.status.state == ControllerState::Alarm {
            return Err(ControllerError::AlarmActive { code: 0 });
        }
        if self.sender.is_desynchronized() {
            return Err(ControllerError::Desynchronized);
        }
        Ok(())
    }

    fn set_workflow(&mut self, state: WorkflowState, effects: &mut Vec<Effect>) {
        if self.workflow == state {
            return;
        }
        tracing::info!("[{}] Workflow {} -> {}", self.port, self.workflow, state);
        self.workflow = state;
        effects.push(self.emit(EngineEvent::WorkflowState {
            port: self.port.clone(),
            state,
        }));
    }

    fn load(&mut self, name: String, text: &str, effects: &mut Vec<Effect>) -> Result<(), ControllerError> {
        self.ensure_not_streaming("load")?;

        let lines = split_lines(text);
        for line in &lines {
            self.sender.validate(&OutgoingCommand::new(line.as_str(), WriteContext::job(None)))?;
        }

        tracing::info!("[{}] Loaded {} ({} lines)", self.port, name, lines.len());
        self.sender.clear_job();
        self.job = Some(Job {
            status: JobStatus::new(name, lines.len()),
            lines,
        });
        self.set_workflow(WorkflowState::Idle, effects);
        Ok(())
    }

    fn start(&mut self, client: ClientId, now: Instant, effects: &mut Vec<Effect>) -> Result<(), ControllerError> {
        if self.workflow != WorkflowState::Idle {
            return Err(self.transition_error("start"));
        }
        if self.job.is_none() {
            return Err(ControllerError::NoJobLoaded);
        }
        self.ensure_ready()?;

        let Some(job) = self.job.as_mut() else {
            return Err(ControllerError::NoJobLoaded);
        };
        let context = WriteContext::job(Some(client));
        let commands = job
            .lines
            .iter()
            .map(|line| OutgoingCommand::new(line.as_str(), context))
            .collect();
        self.sender.enqueue_all(Lane::Job, commands)?;

        let mut status = JobStatus::new(job.status.name.clone(), job.lines.len());
        status.started_at = Some(Utc::now());
        job.status = status.clone();

        tracing::info!("[{}] Starting {} ({} lines)", self.port, status.name, status.total);
        self.sender.resume();
        effects.push(self.emit(EngineEvent::TaskStart {
            port: self.port.clone(),
            job: status,
        }));
        self.set_workflow(WorkflowState::Running, effects);
        self.pump(now, effects);
        self.finish_if_complete(effects);
        Ok(())
    }

    /// Drop the unsent part of the job and return to idle
    fn stop_job(&mut self, effects: &mut Vec<Effect>) {
        self.sender.clear_job();
        self.sender.resume();
        self.stale_job_lines = self.sender.lines_in_flight_from(Lane::Job);
        self.set_workflow(WorkflowState::Idle, effects);
    }

    /// Ctrl-X: the firmware drops its buffer, so the ledger goes too
    fn soft_reset(&mut self, context: WriteContext, effects: &mut Vec<Effect>) {
        effects.push(Effect::realtime(realtime::SOFT_RESET, context));

        let discarded = self.sender.reset_ledger();
        let dropped = self.sender.clear();
        tracing::info!(
            "[{}] Soft reset: {} in flight and {} queued lines dropped",
            self.port,
            discarded.len(),
            dropped
        );
        self.stop_job(effects);
        self.stale_job_lines = 0;
        self.status.alarm = None;
    }

    fn enqueue_immediate(&mut self, lines: Vec<String>, context: WriteContext) -> Result<(), ControllerError> {
        let commands = lines
            .into_iter()
            .map(|line| OutgoingCommand::new(line, context))
            .collect();
        self.sender.enqueue_all(Lane::Immediate, commands)
    }

    /// Write every line the ledger has room for
    fn pump(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        for released in self.sender.release(now) {
            if released.lane == Lane::Job {
                if let Some(job) = self.job.as_mut() {
                    job.status.sent += 1;
                }
            }
            tracing::debug!("[{}] > {}", self.port, released.command.line);
            effects.push(Effect::line(&released.command));
        }
    }

    fn on_ok(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        match self.sender.on_acknowledge(now) {
            Ok(retired) => self.retire(retired, None, now, effects),
            Err(err) => self.unsolicited(err, effects),
        }

        if self.settings_dirty {
            self.settings_dirty = false;
            effects.push(self.emit(self.settings_event()));
        }
    }

    fn on_error(&mut self, code: u8, now: Instant, effects: &mut Vec<Effect>) {
        match self.sender.on_acknowledge(now) {
            Ok(retired) => self.retire(retired, Some(code), now, effects),
            Err(err) => {
                tracing::warn!("[{}] {} with nothing in flight", self.port, firmware_error(code));
                self.unsolicited(err, effects);
            }
        }
    }

    /// An acknowledgment that matches no sent line
    ///
    /// The ledger is left alone; a streaming job can no longer be trusted
    /// and halts.
    fn unsolicited(&mut self, err: FirmwareError, effects: &mut Vec<Effect>) {
        tracing::warn!("[{}] {}", self.port, err);
        if self.is_streaming() {
            self.halt(HaltReason::from(&err), effects);
        }
    }

    fn retire(&mut self, retired: Retired, error_code: Option<u8>, now: Instant, effects: &mut Vec<Effect>) {
        let failure = error_code.map(firmware_error);

        if retired.lane == Lane::Job && self.stale_job_lines > 0 {
            self.stale_job_lines -= 1;
        } else if retired.lane == Lane::Job {
            if let Some(job) = self.job.as_mut() {
                job.status.received += 1;
                if failure.is_some() {
                    job.status.errors += 1;
                }
            }
            if let (Some(code), Some(err)) = (error_code, failure.as_ref()) {
                tracing::warn!("[{}] '{}' failed: {}", self.port, retired.command.line, err);
                match self.error_policy.action_for(code) {
                    ErrorAction::Halt => self.halt(HaltReason::from(err), effects),
                    ErrorAction::Continue => {
                        tracing::info!("[{}] Continuing after error:{}", self.port, code)
                    }
                }
            }
        } else if let Some(err) = failure {
            tracing::warn!("[{}] '{}' failed: {}", self.port, retired.command.line, err);
        } else if retired.command.line.eq_ignore_ascii_case("$X") && self.status.alarm.is_some() {
            // The alarm lock is gone only once the firmware accepts the unlock
            tracing::info!("[{}] Alarm cleared by unlock", self.port);
            self.status.alarm = None;
        }

        self.finish_if_complete(effects);
        self.pump(now, effects);
    }

    fn finish_if_complete(&mut self, effects: &mut Vec<Effect>) {
        if !self.is_streaming() || self.sender.queued(Lane::Job) > 0 {
            return;
        }
        let Some(job) = self.job.as_mut() else {
            return;
        };
        if !job.status.is_complete() {
            return;
        }

        job.status.finished_at = Some(Utc::now());
        let status = job.status.clone();
        tracing::info!(
            "[{}] Finished {} ({} lines, {} errors)",
            self.port,
            status.name,
            status.total,
            status.errors
        );
        self.sender.resume();
        effects.push(self.emit(EngineEvent::TaskFinish {
            port: self.port.clone(),
            job: status,
        }));
        self.set_workflow(WorkflowState::Idle, effects);
    }

    /// Stop releasing job lines and tell everyone why
    fn halt(&mut self, reason: HaltReason, effects: &mut Vec<Effect>) {
        tracing::warn!("[{}] Halted: {}", self.port, reason);
        effects.push(self.emit(EngineEvent::Halted {
            port: self.port.clone(),
            reason: reason.clone(),
        }));

        if !self.is_streaming() {
            return;
        }
        self.sender.pause();
        self.set_workflow(WorkflowState::Halted, effects);
        if let Some(job) = self.job.as_ref() {
            effects.push(self.emit(EngineEvent::TaskError {
                port: self.port.clone(),
                job: job.status.clone(),
                reason,
            }));
        }
    }

    fn on_alarm(&mut self, code: u8, effects: &mut Vec<Effect>) {
        let err = firmware_alarm(code);
        self.status.alarm = Some(code);
        self.status.state = ControllerState::Alarm;
        self.halt(HaltReason::from(&err), effects);
    }

    fn apply_status(&mut self, report: &StatusReport, now: Instant) {
        let Some(state) = report.state else {
            tracing::warn!(
                "[{}] Ignoring status report with unknown state '{}'",
                self.port,
                report.state_word
            );
            return;
        };

        if !self.status.state.is_connected() {
            tracing::info!("[{}] Controller reported in ({})", self.port, state);
        }
        self.status.state = state;
        self.status.sub_state = report.sub_state;
        self.sender.suspend_ack_clock(state.is_holding(), now);
        if state.is_moving() {
            self.sender.extend_ack_window(now);
        }

        if let Some(wco) = report.work_coordinate_offset {
            self.status.work_coordinate_offset = Some(wco);
        }
        let (mpos, wpos) =
            StatusParser::resolve_positions(report, self.status.work_coordinate_offset.as_ref());
        if let Some(mpos) = mpos {
            self.status.machine_position = mpos;
        }
        if let Some(wpos) = wpos {
            self.status.work_position = wpos;
        }

        if report.feed_rate.is_some() {
            self.status.feed_rate = report.feed_rate;
        }
        if report.spindle_speed.is_some() {
            self.status.spindle_speed = report.spindle_speed;
        }
        if let Some(overrides) = report.overrides {
            self.status.overrides = overrides;
        }
        if report.buffer.is_some() {
            self.status.buffer = report.buffer;
        }
        // `Pn:` is omitted when no pin is triggered
        self.status.pins = report.pins.clone();
    }

    /// The banner means the firmware just reset and its buffer is empty
    fn on_startup(&mut self, version: String, now: Instant, effects: &mut Vec<Effect>) {
        tracing::info!("[{}] Firmware {} {} ready", self.port, self.controller_type, version);

        let discarded = self.sender.reset_ledger();
        self.stale_job_lines = 0;
        if self.is_streaming() || !discarded.is_empty() {
            self.halt(
                HaltReason::from(&FirmwareError::ProtocolDesync {
                    reason: format!(
                        "controller reset with {} lines in flight",
                        discarded.len()
                    ),
                }),
                effects,
            );
        }

        self.status.firmware_version = Some(version);
        self.status.state = ControllerState::Idle;
        self.status.sub_state = None;
        self.status.alarm = None;

        let queries = STARTUP_QUERIES
            .iter()
            .map(|q| OutgoingCommand::new(*q, WriteContext::engine()))
            .collect();
        if let Err(e) = self.sender.enqueue_all(Lane::Immediate, queries) {
            tracing::warn!("[{}] Could not queue startup queries: {}", self.port, e);
        }
        self.pump(now, effects);
    }

    /// Emit `controller:state` and `sender:status` when they changed
    fn flush_changes(&mut self, effects: &mut Vec<Effect>) {
        if self.last_status.as_ref() != Some(&self.status) {
            self.last_status = Some(self.status.clone());
            effects.push(Effect::Emit(EngineEvent::ControllerStatus {
                port: self.port.clone(),
                status: Box::new(self.status.clone()),
            }));
        }

        let sender = (self.sender.status(), self.job().cloned());
        if self.last_sender.as_ref() != Some(&sender) {
            effects.push(Effect::Emit(EngineEvent::SenderStatus {
                port: self.port.clone(),
                status: sender.0,
                job: sender.1.clone(),
            }));
            self.last_sender = Some(sender);
        }
    }
}
