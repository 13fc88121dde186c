use gcodemux_communication::firmware::grbl::{ControllerCommand, Effect, GrblController};
use gcodemux_communication::Lane;
use gcodemux_core::{
    ClientId, ControllerError, ControllerState, ControllerType, EngineEvent, HaltCode,
    WorkflowState, WriteContext,
};
use gcodemux_settings::{ErrorAction, StreamingSettings};
use std::time::Duration;
use tokio::time::Instant;

fn settings(rx_buffer_size: usize) -> StreamingSettings {
    StreamingSettings {
        rx_buffer_size: Some(rx_buffer_size),
        ..Default::default()
    }
}

fn connected(settings: &StreamingSettings) -> GrblController {
    let mut c = GrblController::new("/dev/ttyUSB0", 115200, ControllerType::Grbl, settings);
    c.handle_line("<Idle|MPos:0.000,0.000,0.000|FS:0,0>", Instant::now());
    c
}

fn load_and_start(c: &mut GrblController, client: ClientId, text: &str) -> Vec<Effect> {
    c.handle_command(
        ControllerCommand::Load {
            name: "part.nc".into(),
            text: text.into(),
        },
        client,
        Instant::now(),
    )
    .unwrap();
    c.handle_command(ControllerCommand::Start, client, Instant::now())
        .unwrap()
}

fn written(effects: &[Effect]) -> Vec<Vec<u8>> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Write { data, .. } => Some(data.clone()),
            Effect::Emit(_) => None,
        })
        .collect()
}

fn emitted(effects: &[Effect]) -> Vec<&EngineEvent> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Emit(event) => Some(event),
            Effect::Write { .. } => None,
        })
        .collect()
}

fn numbered_job(count: usize) -> String {
    (0..count).map(|i| format!("G1 X{}.000\n", i)).collect()
}

#[test]
fn test_alarm_mid_job_preserves_queue() {
    let mut c = connected(&settings(30));
    let effects = load_and_start(&mut c, ClientId::new(), &numbered_job(13));
    assert_eq!(written(&effects).len(), 3);
    assert_eq!(c.sender().lines_in_flight(), 3);
    assert_eq!(c.sender().queued(Lane::Job), 10);

    let effects = c.handle_line("ALARM:1", Instant::now());
    let halted = emitted(&effects)
        .into_iter()
        .find_map(|event| match event {
            EngineEvent::Halted { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .expect("halt event");
    assert_eq!(halted.code, HaltCode::FirmwareAlarm);
    assert_eq!(c.workflow(), WorkflowState::Halted);
    assert_eq!(c.status().state, ControllerState::Alarm);
    assert_eq!(c.status().alarm, Some(1));

    // Nothing new is released while halted, even as acks come in
    let effects = c.handle_line("ok", Instant::now());
    assert!(written(&effects).is_empty());
    assert_eq!(c.sender().queued(Lane::Job), 10);
}

#[test]
fn test_error_halts_by_default() {
    let mut c = connected(&settings(128));
    load_and_start(&mut c, ClientId::new(), "G1 X1 F100\nG1 X2\nG1 X3\n");

    let effects = c.handle_line("error:9", Instant::now());
    assert_eq!(c.workflow(), WorkflowState::Halted);
    assert!(emitted(&effects)
        .iter()
        .any(|event| matches!(event, EngineEvent::TaskError { .. })));
    assert_eq!(c.job().map(|j| j.errors), Some(1));
}

#[test]
fn test_error_policy_can_continue() {
    let mut s = settings(128);
    s.error_policy.continue_on = vec![9];
    assert_eq!(s.error_policy.action_for(9), ErrorAction::Continue);

    let mut c = connected(&s);
    load_and_start(&mut c, ClientId::new(), "G1 X1 F100\nG1 X2\n");

    c.handle_line("error:9", Instant::now());
    assert_eq!(c.workflow(), WorkflowState::Running);

    let effects = c.handle_line("ok", Instant::now());
    assert_eq!(c.workflow(), WorkflowState::Idle);
    let finished = emitted(&effects)
        .into_iter()
        .find_map(|event| match event {
            EngineEvent::TaskFinish { job, .. } => Some(job.clone()),
            _ => None,
        })
        .expect("task:finish");
    assert_eq!(finished.errors, 1);
    assert_eq!(finished.received, 2);
}

#[test]
fn test_operator_error_does_not_touch_job() {
    let mut c = connected(&settings(128));
    c.handle_write("G99", WriteContext::client(ClientId::new()), Instant::now())
        .unwrap();
    let effects = c.handle_line("error:20", Instant::now());
    assert!(!emitted(&effects)
        .iter()
        .any(|event| matches!(event, EngineEvent::Halted { .. })));
    assert_eq!(c.sender().lines_in_flight(), 0);
}

#[test]
fn test_unsolicited_ok_halts_paused_job() {
    let mut c = connected(&settings(12));
    let client = ClientId::new();
    load_and_start(&mut c, client, &numbered_job(3));
    c.handle_command(ControllerCommand::Pause, client, Instant::now())
        .unwrap();
    c.handle_line("ok", Instant::now());
    assert_eq!(c.sender().lines_in_flight(), 0);

    let effects = c.handle_line("ok", Instant::now());
    assert_eq!(c.sender().bytes_in_flight(), 0);
    assert!(emitted(&effects)
        .iter()
        .any(|event| matches!(event, EngineEvent::Halted { .. })));
    assert_eq!(c.workflow(), WorkflowState::Halted);
    assert_eq!(c.sender().queued(Lane::Job), 2);
}

#[test]
fn test_unsolicited_ok_while_idle_is_ignored() {
    let mut c = connected(&settings(128));
    load_and_start(&mut c, ClientId::new(), "G1 X1 F100\n");
    c.handle_line("ok", Instant::now());
    assert_eq!(c.workflow(), WorkflowState::Idle);

    let effects = c.handle_line("ok", Instant::now());
    assert!(!emitted(&effects)
        .iter()
        .any(|event| matches!(event, EngineEvent::Halted { .. })));
}

#[test]
fn test_pause_and_resume_write_realtime_bytes() {
    let mut c = connected(&settings(12));
    let client = ClientId::new();
    load_and_start(&mut c, client, &numbered_job(4));

    let effects = c
        .handle_command(ControllerCommand::Pause, client, Instant::now())
        .unwrap();
    assert_eq!(written(&effects), vec![vec![b'!']]);
    assert_eq!(c.workflow(), WorkflowState::Paused);

    let effects = c.handle_line("ok", Instant::now());
    assert!(written(&effects).is_empty());

    let effects = c
        .handle_command(ControllerCommand::Resume, client, Instant::now())
        .unwrap();
    assert_eq!(written(&effects)[0], vec![b'~']);
    assert_eq!(written(&effects).len(), 2);
    assert_eq!(c.workflow(), WorkflowState::Running);
}

#[test]
fn test_stop_skips_stale_acknowledgments() {
    let mut c = connected(&settings(20));
    let client = ClientId::new();
    load_and_start(&mut c, client, &numbered_job(5));
    assert_eq!(c.sender().lines_in_flight(), 2);

    c.handle_command(ControllerCommand::Stop { force: false }, client, Instant::now())
        .unwrap();
    assert_eq!(c.workflow(), WorkflowState::Idle);
    assert_eq!(c.sender().queued(Lane::Job), 0);

    load_and_start(&mut c, client, "G0 Z5\n");
    c.handle_line("ok", Instant::now());
    c.handle_line("ok", Instant::now());
    assert_eq!(c.job().map(|j| j.received), Some(0));

    let effects = c.handle_line("ok", Instant::now());
    assert!(emitted(&effects)
        .iter()
        .any(|event| matches!(event, EngineEvent::TaskFinish { .. })));
}

#[test]
fn test_force_stop_soft_resets() {
    let mut c = connected(&settings(128));
    let client = ClientId::new();
    load_and_start(&mut c, client, &numbered_job(3));

    let effects = c
        .handle_command(ControllerCommand::Stop { force: true }, client, Instant::now())
        .unwrap();
    assert_eq!(written(&effects), vec![vec![0x18]]);
    assert_eq!(c.sender().bytes_in_flight(), 0);
}

#[test]
fn test_load_rejects_oversized_line() {
    let mut c = connected(&settings(16));
    let result = c.handle_command(
        ControllerCommand::Load {
            name: "wide.nc".into(),
            text: "G1 X1\nG1 X1.000000 Y2.000000\n".into(),
        },
        ClientId::new(),
        Instant::now(),
    );
    assert!(matches!(result, Err(ControllerError::LineTooLong { .. })));
    assert!(c.job().is_none());
}

#[test]
fn test_load_while_running_rejected() {
    let mut c = connected(&settings(128));
    let client = ClientId::new();
    load_and_start(&mut c, client, "G1 X1\n");
    let result = c.handle_command(
        ControllerCommand::Load {
            name: "other.nc".into(),
            text: "G0 X0".into(),
        },
        client,
        Instant::now(),
    );
    assert!(matches!(
        result,
        Err(ControllerError::InvalidWorkflowTransition { .. })
    ));
}

#[test]
fn test_empty_job_finishes_on_start() {
    let mut c = connected(&settings(128));
    let effects = load_and_start(&mut c, ClientId::new(), "; only a comment\n");
    assert!(emitted(&effects)
        .iter()
        .any(|event| matches!(event, EngineEvent::TaskFinish { .. })));
    assert_eq!(c.workflow(), WorkflowState::Idle);
}

#[test]
fn test_realtime_write_passthrough() {
    let mut c = connected(&settings(128));
    let effects = c
        .handle_write("!", WriteContext::client(ClientId::new()), Instant::now())
        .unwrap();
    assert_eq!(written(&effects), vec![vec![b'!']]);
    assert_eq!(c.sender().bytes_in_flight(), 0);
}

#[test]
fn test_parameters_and_modal_state_mirrored() {
    let mut c = connected(&settings(128));
    let now = Instant::now();
    c.handle_line("[G54:-100.000,-50.000,0.000]", now);
    c.handle_line("[GC:G0 G54 G17 G20 G90 G94 M5 M9 T1 F0 S0]", now);
    assert_eq!(
        c.status().parameters.get("G54").map(String::as_str),
        Some("-100.000,-50.000,0.000")
    );
    assert_eq!(c.status().modal.units.as_deref(), Some("G20"));
    assert_eq!(c.status().modal.tool, Some(1));
}

#[test]
fn test_state_emitted_only_on_change() {
    let mut c = connected(&settings(128));
    let now = Instant::now();
    let effects = c.handle_line("<Idle|MPos:0.000,0.000,0.000|FS:0,0>", now);
    assert!(!emitted(&effects)
        .iter()
        .any(|event| matches!(event, EngineEvent::ControllerStatus { .. })));

    let effects = c.handle_line("<Run|MPos:1.000,0.000,0.000|FS:100,0>", now);
    assert!(emitted(&effects)
        .iter()
        .any(|event| matches!(event, EngineEvent::ControllerStatus { .. })));
}

#[test]
fn test_disconnect_mid_job_halts_with_transport_reason() {
    let mut c = connected(&settings(128));
    load_and_start(&mut c, ClientId::new(), &numbered_job(3));

    let effects = c.on_disconnect("device unplugged");
    let reason = emitted(&effects)
        .into_iter()
        .find_map(|event| match event {
            EngineEvent::Halted { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .expect("halt event");
    assert_eq!(reason.code, HaltCode::TransportError);
    assert_eq!(c.status().state, ControllerState::Disconnected);
    assert_eq!(c.sender().lines_in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ack_timeout_desynchronizes() {
    let mut s = settings(128);
    s.ack_timeout_ms = 1_000;
    let mut c = connected(&s);
    let client = ClientId::new();
    load_and_start(&mut c, client, "G4 P10\nG1 X1\n");

    tokio::time::advance(Duration::from_millis(1_500)).await;
    let effects = c.on_tick(Instant::now());
    assert!(emitted(&effects)
        .iter()
        .any(|event| matches!(event, EngineEvent::TaskError { .. })));
    assert_eq!(c.workflow(), WorkflowState::Halted);
    assert!(c.sender().is_desynchronized());

    assert_eq!(
        c.handle_command(ControllerCommand::Resume, client, Instant::now()),
        Err(ControllerError::Desynchronized)
    );
    assert_eq!(
        c.handle_write("G0 X0", WriteContext::client(client), Instant::now()),
        Err(ControllerError::Desynchronized)
    );

    c.handle_command(ControllerCommand::Reset, client, Instant::now())
        .unwrap();
    assert!(!c.sender().is_desynchronized());
    assert_eq!(c.workflow(), WorkflowState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_long_move_keeps_job_running() {
    let mut c = connected(&settings(128));
    load_and_start(&mut c, ClientId::new(), &numbered_job(40).replace('\n', " F50\n"));
    c.handle_line("ok", Instant::now());

    // The planner is full; no ok arrives while the firmware reports motion
    for _ in 0..6 {
        tokio::time::advance(Duration::from_secs(10)).await;
        c.handle_line("<Run|MPos:1.000,0.000,0.000|FS:50,0>", Instant::now());
        let effects = c.on_tick(Instant::now());
        assert!(!emitted(&effects)
            .iter()
            .any(|event| matches!(event, EngineEvent::Halted { .. })));
    }
    assert_eq!(c.workflow(), WorkflowState::Running);
    assert!(!c.sender().is_desynchronized());

    // Status reports stop: the window runs out again
    tokio::time::advance(Duration::from_secs(31)).await;
    c.on_tick(Instant::now());
    assert!(c.sender().is_desynchronized());
    assert_eq!(c.workflow(), WorkflowState::Halted);
}

#[test]
fn test_rejected_unlock_keeps_alarm() {
    let mut c = connected(&settings(128));
    let client = ClientId::new();
    c.handle_line("ALARM:2", Instant::now());
    assert_eq!(c.status().alarm, Some(2));

    c.handle_command(ControllerCommand::Unlock, client, Instant::now())
        .unwrap();
    assert_eq!(c.status().alarm, Some(2));
    c.handle_line("error:9", Instant::now());
    assert_eq!(c.status().alarm, Some(2));

    c.handle_write("$x", WriteContext::client(client), Instant::now())
        .unwrap();
    c.handle_line("ok", Instant::now());
    assert_eq!(c.status().alarm, None);
}
