//! Command protocol spoken with the rig microcontroller.
//!
//! Outbound commands are pipe-delimited ASCII (`m|X|Y|feedXY|feedY`,
//! `startMotor|pwm1|pwm2`, `tare`, ...). `Command` renders them through
//! `Display`, so `command.to_string()` is exactly what goes on the wire
//! minus the terminator.
//!
//! Inbound lines are classified by `parse_line` into typed `Event`s. Status
//! markers are matched case-insensitively anywhere in the line. Structured
//! records (`Measurements:`, `LC test:`, `CalVal:`, `RPM_test:`) are
//! recognised by prefix; a record whose payload does not parse is dropped
//! with a debug log and never surfaces as an error.

use crate::config::{CalibrationConfig, RigConfig};
use crate::data::frame::TelemetryFrame;
use std::fmt;
use tracing::debug;

/// Outbound rig command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Absolute measurement move in steps
    Move {
        x: i64,
        y: i64,
        feed_xy: u32,
        feed_y: u32,
    },
    /// Absolute jog move in steps
    Jog {
        x: i64,
        y: i64,
        feed_xy: u32,
        feed_y: u32,
    },
    Tare,
    StartMotor { pwm1: u32, pwm2: u32 },
    Stop,
    BeaconOn,
    BeaconOff,
    Home,
    Center,
    /// Enable/disable motor power
    PowerOn,
    PowerOff,
    /// Load cell arm lengths and factors for both rotors
    Init {
        calibration: CalibrationConfig,
        props: u8,
    },
    /// Axis geometry and motion limits
    AxisLimits {
        x_center_steps: i64,
        y_max_steps: i64,
        x_max_speed: u32,
        y_max_speed: u32,
        x_max_accel: u32,
        y_max_accel: u32,
    },
    SetMin { motor: u8, pwm: u32 },
    SetMax { motor: u8, pwm: u32 },
    SetRamp { ms: u32 },
    TrimAoa(i32),
    AoaLimit(i32),
    TrimAoss(i32),
    AossLimitMax(i32),
    AossLimitMin(i32),
    EnableAoss,
    DisableAoss,
    CalTorque,
    CalThrust,
    CalMass(f64),
    SetFirstTrqCalVal(f64),
    SetFirstThrCalVal(f64),
    /// Open-loop motor test at a fixed pulse width
    MotorTest { motor: u8, pwm: u32 },
}

impl Command {
    /// Measurement move using the rig's configured feeds.
    pub fn move_to(x: i64, y: i64, rig: &RigConfig) -> Self {
        Command::Move {
            x,
            y,
            feed_xy: rig.feed_xy,
            feed_y: rig.feed_y(),
        }
    }

    /// Jog at the configured jog feed on both axes.
    pub fn jog_to(x: i64, y: i64, rig: &RigConfig) -> Self {
        Command::Jog {
            x,
            y,
            feed_xy: rig.jog_feed,
            feed_y: rig.jog_feed,
        }
    }

    pub fn axis_limits(rig: &RigConfig) -> Self {
        Command::AxisLimits {
            x_center_steps: rig.x_center_steps(),
            y_max_steps: rig.y_max_steps(),
            x_max_speed: rig.x_max_speed,
            y_max_speed: rig.y_max_speed,
            x_max_accel: rig.x_max_accel,
            y_max_accel: rig.y_max_accel,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Move {
                x,
                y,
                feed_xy,
                feed_y,
            } => write!(f, "m|{}|{}|{}|{}", x, y, feed_xy, feed_y),
            Command::Jog {
                x,
                y,
                feed_xy,
                feed_y,
            } => write!(f, "j|{}|{}|{}|{}", x, y, feed_xy, feed_y),
            Command::Tare => f.write_str("tare"),
            Command::StartMotor { pwm1, pwm2 } => write!(f, "startMotor|{}|{}", pwm1, pwm2),
            Command::Stop => f.write_str("stop"),
            Command::BeaconOn => f.write_str("BeaconON"),
            Command::BeaconOff => f.write_str("BeaconOFF"),
            Command::Home => f.write_str("home"),
            Command::Center => f.write_str("center"),
            Command::PowerOn => f.write_str("ON"),
            Command::PowerOff => f.write_str("OFF"),
            Command::Init { calibration: c, props } => write!(
                f,
                "init|{:.2}|{:.2}|{:.2}|{:.2}|{:.2}|{:.2}|{:.2}|{:.2}|{}",
                c.first_trq_arm_mm,
                c.first_trq_factor,
                c.first_thr_arm_mm,
                c.first_thr_factor,
                c.second_trq_arm_mm,
                c.second_trq_factor,
                c.second_thr_arm_mm,
                c.second_thr_factor,
                props
            ),
            Command::AxisLimits {
                x_center_steps,
                y_max_steps,
                x_max_speed,
                y_max_speed,
                x_max_accel,
                y_max_accel,
            } => write!(
                f,
                "l|{}|{}|{}|{}|{}|{}",
                x_center_steps, y_max_steps, x_max_speed, y_max_speed, x_max_accel, y_max_accel
            ),
            Command::SetMin { motor, pwm } => write!(f, "setMin|{}|{}", motor, pwm),
            Command::SetMax { motor, pwm } => write!(f, "setMax|{}|{}", motor, pwm),
            Command::SetRamp { ms } => write!(f, "setRamp|{}", ms),
            Command::TrimAoa(v) => write!(f, "trimAoA|{}", v),
            Command::AoaLimit(v) => write!(f, "AoAlim|{}", v),
            Command::TrimAoss(v) => write!(f, "trimAoSS|{}", v),
            Command::AossLimitMax(v) => write!(f, "AoSSLimMax|{}", v),
            Command::AossLimitMin(v) => write!(f, "AoSSLimMin|{}", v),
            Command::EnableAoss => f.write_str("enableAoSS"),
            Command::DisableAoss => f.write_str("disableAoSS"),
            Command::CalTorque => f.write_str("calTorque"),
            Command::CalThrust => f.write_str("calThrust"),
            Command::CalMass(g) => write!(f, "calMass|{:.2}", g),
            Command::SetFirstTrqCalVal(v) => write!(f, "setFirstTrqCalVal|{:.2}", v),
            Command::SetFirstThrCalVal(v) => write!(f, "setFirstThrCalVal|{:.2}", v),
            Command::MotorTest { motor, pwm } => write!(f, "test{}|{}", motor, pwm),
        }
    }
}

/// Ten-field load cell report sent while calibrating or testing motors.
///
/// Corrected channels arrive in thousandths and are scaled back here.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub thrust1: f64,
    pub thrust1_raw_g: f64,
    pub torque1: f64,
    pub torque1_raw_g: f64,
    pub rpm1: f64,
    pub thrust2: f64,
    pub thrust2_raw_g: f64,
    pub torque2: f64,
    pub torque2_raw_g: f64,
    pub rpm2: f64,
}

impl CalibrationReport {
    fn from_fields(v: &[f64]) -> Self {
        Self {
            thrust1: v[0] / 1000.0,
            thrust1_raw_g: v[1],
            torque1: v[2] / 1000.0,
            torque1_raw_g: v[3],
            rpm1: v[4],
            thrust2: v[5] / 1000.0,
            thrust2_raw_g: v[6],
            torque2: v[7] / 1000.0,
            torque2_raw_g: v[8],
            rpm2: v[9],
        }
    }
}

/// Inbound line, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ready,
    HomingDone,
    TareDone,
    CenteringDone,
    JogDone,
    LimitSwitch,
    Emergency,
    EmergencyCleared,
    OverAxisLimit,
    Calibration(CalibrationReport),
    CalibrationValue(f64),
    RpmTest(f64),
    Telemetry(TelemetryFrame),
}

const TELEMETRY_PREFIX: &str = "measurements:";
const CALIBRATION_PREFIX: &str = "lc test:";
const CAL_VALUE_PREFIX: &str = "calval:";
const RPM_TEST_PREFIX: &str = "rpm_test:";
const CALIBRATION_FIELDS: usize = 10;

/// Status markers in match order. `emergency cleared` must be tested before
/// `emergency!` and `over axis limit` before `limit switch`.
const MARKERS: &[(&str, Event)] = &[
    ("emergency cleared", Event::EmergencyCleared),
    ("emergency!", Event::Emergency),
    ("over axis limit", Event::OverAxisLimit),
    ("limit switch", Event::LimitSwitch),
    ("homing done", Event::HomingDone),
    ("tare done", Event::TareDone),
    ("centering done", Event::CenteringDone),
    ("jog done", Event::JogDone),
    ("ready!", Event::Ready),
];

/// Classify one trimmed inbound line. `arity` is the frame length the rig is
/// expected to stream (10 or 13).
pub fn parse_line(line: &str, arity: usize) -> Option<Event> {
    let lower = line.to_ascii_lowercase();

    if let Some(payload) = payload_after(line, &lower, TELEMETRY_PREFIX) {
        let values = parse_numbers(payload)?;
        if values.is_empty() {
            debug!("Dropping empty telemetry record: {:?}", line);
            return None;
        }
        return Some(Event::Telemetry(TelemetryFrame::normalized(values, arity)));
    }

    if let Some(payload) = payload_after(line, &lower, CALIBRATION_PREFIX) {
        let values = parse_numbers(payload)?;
        if values.len() != CALIBRATION_FIELDS {
            debug!(
                fields = values.len(),
                "Dropping calibration report with wrong field count"
            );
            return None;
        }
        return Some(Event::Calibration(CalibrationReport::from_fields(&values)));
    }

    if let Some(payload) = payload_after(line, &lower, CAL_VALUE_PREFIX) {
        return parse_single(payload).map(Event::CalibrationValue);
    }

    if let Some(payload) = payload_after(line, &lower, RPM_TEST_PREFIX) {
        return parse_single(payload).map(Event::RpmTest);
    }

    MARKERS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, event)| event.clone())
}

/// Text following `prefix`, located case-insensitively. ASCII lowering keeps
/// byte offsets identical between `line` and `lower`.
fn payload_after<'a>(line: &'a str, lower: &str, prefix: &str) -> Option<&'a str> {
    lower
        .find(prefix)
        .map(|pos| line[pos + prefix.len()..].trim())
}

/// Whitespace or pipe separated numbers; `None` if any token is not numeric.
fn parse_numbers(payload: &str) -> Option<Vec<f64>> {
    let mut values = Vec::with_capacity(13);
    for token in payload
        .split(|c: char| c.is_whitespace() || c == '|')
        .filter(|t| !t.is_empty())
    {
        match token.parse::<f64>() {
            Ok(v) if v.is_finite() => values.push(v),
            _ => {
                debug!("Dropping record with non-numeric token {:?}", token);
                return None;
            }
        }
    }
    Some(values)
}

fn parse_single(payload: &str) -> Option<f64> {
    match parse_numbers(payload)?.as_slice() {
        [v] => Some(*v),
        other => {
            debug!(fields = other.len(), "Expected a single value");
            None
        }
    }
}
