use gcodemux_communication::firmware::grbl::status_parser::*;
use gcodemux_core::{BufferState, CNCPoint, ControllerState, OverrideState};

#[test]
fn test_full_report() {
    let report = StatusParser::parse_full(
        "<Run|MPos:10.000,5.000,2.500|Bf:15,128|FS:500,8000|Ov:120,100,90|Pn:XZ|Ln:42>",
    );
    assert_eq!(report.state, Some(ControllerState::Run));
    assert_eq!(report.machine_position.map(|p| p.y), Some(5.0));
    assert_eq!(report.buffer, Some(BufferState { planner: 15, rx: 128 }));
    assert_eq!(report.feed_rate, Some(500.0));
    assert_eq!(report.spindle_speed, Some(8000.0));
    assert_eq!(
        report.overrides,
        Some(OverrideState {
            feed: 120,
            rapid: 100,
            spindle: 90
        })
    );
    assert_eq!(report.pins.as_deref(), Some("XZ"));
    assert_eq!(report.line_number, Some(42));
}

#[test]
fn test_legacy_buffer_field() {
    let report = StatusParser::parse_full("<Idle|WPos:0.000,0.000,0.000|Buf:15:128>");
    assert_eq!(report.buffer, Some(BufferState { planner: 15, rx: 128 }));
}

#[test]
fn test_four_axis_positions() {
    let report = StatusParser::parse_full("<Idle|MPos:1.000,2.000,3.000,90.000|FS:0,0>");
    let mpos = report.machine_position.unwrap();
    assert_eq!(mpos.a, 90.0);
}

#[test]
fn test_resolve_wpos_from_mpos() {
    let report = StatusParser::parse_full("<Idle|MPos:10.000,10.000,10.000|FS:0,0>");
    let wco = CNCPoint::from_axes(&[2.0, 3.0, 4.0]);
    let (mpos, wpos) = StatusParser::resolve_positions(&report, Some(&wco));
    assert_eq!(mpos.map(|p| p.x), Some(10.0));
    assert_eq!(wpos, Some(CNCPoint::from_axes(&[8.0, 7.0, 6.0])));
}

#[test]
fn test_resolve_mpos_from_wpos() {
    let report =
        StatusParser::parse_full("<Idle|WPos:1.000,1.000,1.000|FS:0,0|WCO:1.000,2.000,3.000>");
    let (mpos, wpos) = StatusParser::resolve_positions(&report, None);
    assert_eq!(mpos, Some(CNCPoint::from_axes(&[2.0, 3.0, 4.0])));
    assert_eq!(wpos.map(|p| p.x), Some(1.0));
}

#[test]
fn test_resolve_without_offset_leaves_other_space_unknown() {
    let report = StatusParser::parse_full("<Idle|MPos:1.000,1.000,1.000|FS:0,0>");
    let (mpos, wpos) = StatusParser::resolve_positions(&report, None);
    assert!(mpos.is_some());
    assert!(wpos.is_none());
}
