//! Mock Hardware Implementations
//!
//! `MockRig` simulates the rig microcontroller on the far end of an
//! in-memory duplex pipe. It answers the line protocol the way the firmware
//! does and streams a `Measurements:` frame every `frame_interval`.
//!
//! # Behavior
//!
//! - `tare` → `tare done`, `home` → `homing done`, `center` → `centering done`
//! - `m|X|Y|..` moves toward the target by at most `steps_per_frame` per frame
//! - `j|X|Y|..` moves the same way and reports `jog done` on arrival
//! - `stop` halts motion and motors
//! - `startMotor|p1|p2` spins the rotors up to an RPM proportional to throttle
//! - `test1|pwm` / `test2|pwm` → `RPM_test: N`, `calTorque` / `calThrust` →
//!   an `LC test:` report
//!
//! Faults can be injected for tests: an axis limit below which moves are
//! refused with `over axis limit`, and an `emergency!` on the n-th move.
//!
//! The wake is synthetic: airspeed peaks at mid blade and falls to zero
//! past the tip, with a fixed swirl angle.

use crate::adapters::TelemetryLink;
use crate::config::Settings;
use std::f64::consts::PI;
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Tunables of the simulated rig.
#[derive(Debug, Clone, PartialEq)]
pub struct MockRigConfig {
    pub steps_per_mm: f64,
    pub x_center_steps: i64,
    pub radius_mm: f64,
    pub frame_interval: Duration,
    pub steps_per_frame: i64,
    /// Refuse moves whose X target is below this
    pub over_axis_limit_below: Option<i64>,
    /// Report `emergency!` instead of executing the n-th `m|` move (1-based)
    pub emergency_at_move: Option<usize>,
    /// Never answer `tare`
    pub silent_tare: bool,
}

impl MockRigConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            steps_per_mm: settings.rig.steps_per_mm,
            x_center_steps: settings.rig.x_center_steps(),
            radius_mm: settings.propeller.radius_mm(),
            frame_interval: Duration::from_millis(20),
            steps_per_frame: (settings.rig.steps_per_mm * 2.0).round().max(1.0) as i64,
            over_axis_limit_below: None,
            emergency_at_move: None,
            silent_tare: false,
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_steps_per_frame(mut self, steps: i64) -> Self {
        self.steps_per_frame = steps.max(1);
        self
    }

    pub fn with_axis_limit_below(mut self, x_steps: i64) -> Self {
        self.over_axis_limit_below = Some(x_steps);
        self
    }

    pub fn with_emergency_at_move(mut self, n: usize) -> Self {
        self.emergency_at_move = Some(n);
        self
    }

    pub fn with_silent_tare(mut self) -> Self {
        self.silent_tare = true;
        self
    }
}

/// Simulated rig microcontroller
pub struct MockRig {
    config: MockRigConfig,
    x: i64,
    y: i64,
    target: (i64, i64),
    jogging: bool,
    rpm: [f64; 2],
    moves: usize,
}

impl MockRig {
    /// Rig parked at home (0, 0) with motors stopped
    pub fn new(config: MockRigConfig) -> Self {
        Self {
            config,
            x: 0,
            y: 0,
            target: (0, 0),
            jogging: false,
            rpm: [0.0; 2],
            moves: 0,
        }
    }

    pub fn position(&self) -> (i64, i64) {
        (self.x, self.y)
    }

    /// Lines the firmware would answer with.
    pub fn handle_command(&mut self, line: &str) -> Vec<String> {
        let fields: Vec<&str> = line.trim().split('|').collect();
        let num = |i: usize| fields.get(i).and_then(|f| f.trim().parse::<f64>().ok());
        let mut replies = Vec::new();

        match fields.first().copied().unwrap_or_default() {
            "tare" if !self.config.silent_tare => replies.push("tare done".to_string()),
            "home" => {
                self.x = 0;
                self.y = 0;
                self.target = (0, 0);
                replies.push("homing done".to_string());
            }
            "center" => {
                self.x = self.config.x_center_steps;
                self.target = (self.x, self.y);
                replies.push("centering done".to_string());
            }
            "startMotor" => {
                for (motor, pwm) in [num(1), num(2)].into_iter().enumerate() {
                    self.rpm[motor] = rpm_for_pwm(pwm.unwrap_or(1000.0));
                }
            }
            "stop" => {
                self.rpm = [0.0; 2];
                self.target = (self.x, self.y);
                self.jogging = false;
            }
            "m" | "j" => {
                let (Some(x), Some(y)) = (num(1), num(2)) else {
                    return replies;
                };
                let (x, y) = (x as i64, y as i64);
                let jog = fields[0] == "j";
                if !jog {
                    self.moves += 1;
                    if self.config.emergency_at_move == Some(self.moves) {
                        self.rpm = [0.0; 2];
                        self.target = (self.x, self.y);
                        replies.push("emergency!".to_string());
                        return replies;
                    }
                }
                if self.config.over_axis_limit_below.is_some_and(|limit| x < limit) {
                    replies.push("over axis limit".to_string());
                    return replies;
                }
                self.target = (x, y);
                self.jogging = jog;
            }
            "test1" | "test2" => {
                let rpm = rpm_for_pwm(num(1).unwrap_or(1000.0));
                replies.push(format!("RPM_test: {:.0}", rpm));
            }
            "calTorque" | "calThrust" => {
                replies.push(
                    "LC test: 1500 153 25 2.5 6000 0 0 0 0 0".to_string(),
                );
            }
            "calMass" => replies.push("CalVal: 1.0025".to_string()),
            "init" | "l" => replies.push("ready!".to_string()),
            other => debug!("Mock rig ignoring {:?}", other),
        }
        replies
    }

    /// Advance one frame: move toward the target and report.
    pub fn step(&mut self) -> Vec<String> {
        let limit = self.config.steps_per_frame;
        self.x += (self.target.0 - self.x).clamp(-limit, limit);
        self.y += (self.target.1 - self.y).clamp(-limit, limit);

        let mut lines = vec![self.measurement()];
        if self.jogging && (self.x, self.y) == self.target {
            self.jogging = false;
            lines.push("jog done".to_string());
        }
        lines
    }

    fn measurement(&self) -> String {
        let r_mm = (self.x - self.config.x_center_steps).abs() as f64 / self.config.steps_per_mm;
        let spinning = self.rpm[0] > 0.0;
        let airspeed = if spinning && r_mm <= self.config.radius_mm {
            2.0 + 10.0 * (PI * r_mm / self.config.radius_mm).sin()
        } else {
            0.0
        };
        let thrust_mn = self.rpm[0] * 0.5;
        let torque_nmm = self.rpm[0] * 0.004;
        let thrust2_mn = self.rpm[1] * 0.5;
        let torque2_nmm = self.rpm[1] * 0.004;
        format!(
            "Measurements: {} {} {:.1} {:.2} {:.0} {:.2} {:.2} {:.2} {:.2} {:.2} {:.1} {:.2} {:.0}",
            self.x,
            self.y,
            thrust_mn,
            torque_nmm,
            self.rpm[0],
            airspeed,
            0.5,
            if spinning { -8.0 } else { 0.0 },
            0.0,
            if spinning { 1.5 } else { 0.0 },
            thrust2_mn,
            torque2_nmm,
            self.rpm[1],
        )
    }

    /// Serve the protocol on `stream` until the peer hangs up.
    pub async fn run(mut self, stream: DuplexStream) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut ticker = tokio::time::interval(self.config.frame_interval);
        info!("Mock rig started");

        loop {
            let replies = tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_command(&line),
                    Ok(None) | Err(_) => break,
                },
                _ = ticker.tick() => self.step(),
            };
            for reply in replies {
                let payload = format!("{}\r\n", reply);
                if writer.write_all(payload.as_bytes()).await.is_err() {
                    info!("Mock rig peer closed");
                    return;
                }
            }
        }
        info!("Mock rig stopped");
    }
}

fn rpm_for_pwm(pwm: f64) -> f64 {
    ((pwm - 1000.0).max(0.0) * 10.0).round()
}

/// Start a mock rig task and return a link connected to it.
pub fn spawn_mock_rig(config: MockRigConfig) -> (TelemetryLink<DuplexStream>, JoinHandle<()>) {
    let (client, rig_end) = duplex(64 * 1024);
    let task = tokio::spawn(MockRig::new(config).run(rig_end));
    (TelemetryLink::new(client), task)
}
