use gcodemux_communication::firmware::grbl::response_parser::*;
use gcodemux_core::ControllerState;

#[test]
fn test_parse_ok() {
    assert_eq!(parse_line("ok"), ParsedLine::Ok);
    assert_eq!(parse_line("ok\r"), ParsedLine::Ok);
    assert!(matches!(parse_line("okay"), ParsedLine::Unrecognized(_)));
}

#[test]
fn test_parse_error() {
    assert_eq!(parse_line("error:1"), ParsedLine::Error(1));
    assert_eq!(parse_line("error:23"), ParsedLine::Error(23));
    assert_eq!(parse_line("error: Bad number format"), ParsedLine::Error(0));
}

#[test]
fn test_parse_alarm() {
    assert_eq!(parse_line("ALARM:1"), ParsedLine::Alarm(1));
    assert_eq!(parse_line("alarm:6"), ParsedLine::Alarm(6));
}

#[test]
fn test_parse_status_report() {
    let ParsedLine::Status(report) =
        parse_line("<Idle|MPos:0.000,0.000,0.000|FS:0,0|WCO:0.000,0.000,0.000>")
    else {
        panic!("expected a status report");
    };
    assert_eq!(report.state, Some(ControllerState::Idle));
    assert!(report.machine_position.is_some());
    assert!(report.work_coordinate_offset.is_some());
}

#[test]
fn test_unknown_state_word_keeps_status_shape() {
    let ParsedLine::Status(report) = parse_line("<Tool|MPos:1.000,2.000,3.000>") else {
        panic!("expected a status report");
    };
    assert_eq!(report.state, None);
    assert_eq!(report.state_word, "Tool");
}

#[test]
fn test_parse_parser_state() {
    let ParsedLine::ParserState(modal) =
        parse_line("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]")
    else {
        panic!("expected parser state");
    };
    assert_eq!(modal.motion.as_deref(), Some("G0"));
    assert_eq!(modal.wcs.as_deref(), Some("G54"));
    assert_eq!(modal.units.as_deref(), Some("G21"));
    assert_eq!(modal.coolant, vec!["M9".to_string()]);
    assert_eq!(modal.tool, Some(0));
}

#[test]
fn test_parse_parameters() {
    assert_eq!(
        parse_line("[G54:-100.000,-50.000,0.000]"),
        ParsedLine::Parameter {
            name: "G54".into(),
            value: "-100.000,-50.000,0.000".into()
        }
    );
    assert_eq!(
        parse_line("[PRB:0.000,0.000,-1.234:1]"),
        ParsedLine::Parameter {
            name: "PRB".into(),
            value: "0.000,0.000,-1.234:1".into()
        }
    );
}

#[test]
fn test_parse_feedback() {
    assert_eq!(
        parse_line("[MSG:'$H'|'$X' to unlock]"),
        ParsedLine::Feedback("'$H'|'$X' to unlock".into())
    );
    assert_eq!(
        parse_line("[VER:1.1h.20190825:]"),
        ParsedLine::Feedback("VER:1.1h.20190825:".into())
    );
}

#[test]
fn test_parse_setting() {
    assert_eq!(
        parse_line("$110=500.000"),
        ParsedLine::Setting {
            number: 110,
            value: "500.000".into()
        }
    );
    assert!(matches!(parse_line("$N0="), ParsedLine::Unrecognized(_)));
}

#[test]
fn test_parse_startup() {
    assert_eq!(
        parse_line("Grbl 1.1h ['$' for help]"),
        ParsedLine::Startup {
            version: "1.1h".into()
        }
    );
    assert_eq!(
        parse_line("GrblHAL 1.1f ['$' or '$HELP' for help]"),
        ParsedLine::Startup {
            version: "1.1f".into()
        }
    );
    assert!(matches!(
        parse_line("Grbl is great"),
        ParsedLine::Unrecognized(_)
    ));
}

#[test]
fn test_garbage_is_never_dropped() {
    assert_eq!(
        parse_line("\u{fffd}\u{fffd}xx"),
        ParsedLine::Unrecognized("\u{fffd}\u{fffd}xx".into())
    );
}
