//! GRBL Error and Alarm Code Decoder
//! Converts numeric error and alarm codes to human-readable messages

use gcodemux_core::FirmwareError;

const ERRORS: &[(u8, &str)] = &[
    (1, "Expected command letter"),
    (2, "Bad number format"),
    (3, "Invalid statement"),
    (4, "Value < 0"),
    (5, "Setting disabled"),
    (6, "Value < 3 usec"),
    (7, "EEPROM read fail. Using defaults"),
    (8, "Not idle"),
    (9, "G-code lock"),
    (10, "Homing not enabled"),
    (11, "Line overflow"),
    (12, "Step rate > 30kHz"),
    (13, "Check Door"),
    (14, "Line length exceeded"),
    (15, "Travel exceeded"),
    (16, "Invalid jog command"),
    (17, "Setting disabled"),
    (20, "Unsupported command"),
    (21, "Modal group violation"),
    (22, "Undefined feed rate"),
    (23, "Invalid gcode ID:23"),
    (24, "Invalid gcode ID:24"),
    (25, "Invalid gcode ID:25"),
    (26, "Invalid gcode ID:26"),
    (27, "Invalid gcode ID:27"),
    (28, "Invalid gcode ID:28"),
    (29, "Invalid gcode ID:29"),
    (30, "Invalid gcode ID:30"),
    (31, "Invalid gcode ID:31"),
    (32, "Invalid gcode ID:32"),
    (33, "Invalid gcode ID:33"),
    (34, "Invalid gcode ID:34"),
    (35, "Invalid gcode ID:35"),
    (36, "Invalid gcode ID:36"),
    (37, "Invalid gcode ID:37"),
    (38, "Invalid gcode ID:38"),
    (39, "Canned cycle not active"),
    (40, "Value word missing"),
    (41, "Value word conflict"),
    (42, "Invalid canned cycle retract mode"),
    (43, "Spindle speed not set"),
    (45, "Max step rate exceeded"),
    (46, "Door already open"),
    (47, "Illegal operation in program"),
    (48, "Unsupported P-parameter"),
    (49, "Value out of range"),
    (60, "Invalid value"),
    (62, "Illegal home state"),
    (65, "Disabled"),
    (69, "Homing required"),
    (72, "Not allowed"),
    (74, "Busy"),
];

const ALARMS: &[(u8, &str)] = &[
    (1, "Hard limit"),
    (2, "Soft limit"),
    (3, "Abort during cycle"),
    (4, "Probe fail"),
    (5, "Probe fail"),
    (6, "Homing fail"),
    (7, "Homing fail"),
    (8, "Homing fail"),
    (9, "Homing fail"),
    (10, "Limit switch engaged"),
    (11, "Homing required"),
    (12, "E-stop asserted"),
    (13, "Motor fault"),
    (14, "Homing configuration error"),
    (15, "Self-test failed"),
    (16, "Spindle at speed timeout"),
    (17, "Probe protection triggered"),
];

fn lookup(table: &'static [(u8, &'static str)], code: u8) -> Option<&'static str> {
    table
        .binary_search_by_key(&code, |(c, _)| *c)
        .ok()
        .map(|i| table[i].1)
}

/// Short description of an `error:N` code
pub fn error_message(code: u8) -> &'static str {
    match code {
        0 => "Legacy text error",
        _ => lookup(ERRORS, code).unwrap_or("Unknown error"),
    }
}

/// Short description of an `ALARM:N` code
pub fn alarm_message(code: u8) -> &'static str {
    match code {
        0 => "Legacy text alarm",
        _ => lookup(ALARMS, code).unwrap_or("Unknown alarm"),
    }
}

/// Typed error for an `error:N` line
pub fn firmware_error(code: u8) -> FirmwareError {
    FirmwareError::Error {
        code,
        message: error_message(code).to_string(),
    }
}

/// Typed error for an `ALARM:N` line
pub fn firmware_alarm(code: u8) -> FirmwareError {
    FirmwareError::Alarm {
        code,
        message: alarm_message(code).to_string(),
    }
}
