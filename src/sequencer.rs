//! Motion sequencer for one probe sweep.
//!
//! The sequencer is a closed state machine driven from the session loop. It
//! never performs I/O: every input (`start`, `on_event`, `on_tick`, `abort`)
//! takes the current time and returns the `Action`s the caller must carry out
//! in order. Waiting is modeled as a state carrying a deadline; the session
//! sleeps until `next_deadline()` and then calls `on_tick`.
//!
//! ```text
//! Idle → Beacon → AwaitTare → AwaitMotorSpin → AwaitRpmStable
//!      → PreSettle (optional)
//!      → Traverse(0) → ArrivalPending(0) → Traverse(1) → ...
//!      → SweepDone → ReturnHome → Idle
//! ```
//!
//! Faults:
//! - `over axis limit` while moving: `stop`, re-issue the same leg once, then
//!   give up with a motion fault.
//! - `emergency!` anywhere: `stop`, abort, back to `Idle`.
//!
//! Binning only starts once rotor 1 reports a steady RPM: `rpm_stable_frames`
//! consecutive frames above `rpm_min`, each within `rpm_stable_delta` of the
//! one before. If that never happens within the settle timeout the sweep
//! proceeds with a warning.

use crate::config::Settings;
use crate::error::DaqError;
use crate::protocol::{Command, Event};
use crate::trajectory::Waypoint;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Which half of the pre-settle dither is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DitherLeg {
    /// Moving to center − d, toward home
    Away,
    /// Moving back onto center
    Return,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SequencerState {
    Idle,
    Beacon {
        until: Instant,
    },
    AwaitTare {
        deadline: Instant,
    },
    AwaitMotorSpin {
        until: Instant,
    },
    /// Waiting for a run of steady RPM frames
    AwaitRpmStable {
        deadline: Instant,
        last_rpm: Option<f64>,
        stable: usize,
    },
    PreSettle {
        leg: DitherLeg,
        target: Waypoint,
        deadline: Instant,
        retried: bool,
    },
    /// Move to waypoint `index` issued, waiting for arrival
    Traverse {
        index: usize,
        deadline: Instant,
        retried: bool,
    },
    /// Arrived at waypoint `index`, collecting samples
    ArrivalPending {
        index: usize,
        samples: usize,
        deadline: Instant,
        retried: bool,
    },
    SweepDone,
    ReturnHome {
        deadline: Instant,
    },
}

impl SequencerState {
    fn deadline(&self) -> Option<Instant> {
        match self {
            SequencerState::Beacon { until } | SequencerState::AwaitMotorSpin { until } => {
                Some(*until)
            }
            SequencerState::AwaitTare { deadline }
            | SequencerState::AwaitRpmStable { deadline, .. }
            | SequencerState::PreSettle { deadline, .. }
            | SequencerState::Traverse { deadline, .. }
            | SequencerState::ArrivalPending { deadline, .. }
            | SequencerState::ReturnHome { deadline } => Some(*deadline),
            SequencerState::Idle | SequencerState::SweepDone => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SequencerState::Idle => "Idle",
            SequencerState::Beacon { .. } => "Beacon",
            SequencerState::AwaitTare { .. } => "AwaitTare",
            SequencerState::AwaitMotorSpin { .. } => "AwaitMotorSpin",
            SequencerState::AwaitRpmStable { .. } => "AwaitRpmStable",
            SequencerState::PreSettle { .. } => "PreSettle",
            SequencerState::Traverse { .. } => "Traverse",
            SequencerState::ArrivalPending { .. } => "ArrivalPending",
            SequencerState::SweepDone => "SweepDone",
            SequencerState::ReturnHome { .. } => "ReturnHome",
        }
    }
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencerState::Traverse { index, .. } => write!(f, "Traverse({})", index),
            SequencerState::ArrivalPending { index, .. } => {
                write!(f, "ArrivalPending({})", index)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Reason a sweep ended early.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionFault {
    OverAxisLimit { index: Option<usize> },
    Emergency,
    OverallTimeout,
}

impl fmt::Display for MotionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionFault::OverAxisLimit { index: Some(i) } => {
                write!(f, "over axis limit at waypoint {} after retry", i)
            }
            MotionFault::OverAxisLimit { index: None } => {
                f.write_str("over axis limit during pre-settle after retry")
            }
            MotionFault::Emergency => f.write_str("emergency stop"),
            MotionFault::OverallTimeout => f.write_str("overall sweep timeout"),
        }
    }
}

impl From<MotionFault> for DaqError {
    fn from(fault: MotionFault) -> Self {
        match fault {
            MotionFault::Emergency => DaqError::EmergencyStop,
            other => DaqError::MotionFault(other.to_string()),
        }
    }
}

/// Progress notifications for subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    StateChanged(String),
    PointStarted {
        index: usize,
        total: usize,
        target: Waypoint,
    },
    PointDone {
        index: usize,
    },
    SweepComplete,
    ReturnedHome,
    Fault(MotionFault),
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(Command),
    /// Reset the aggregator and start binning telemetry
    StartLogging,
    /// Flush the partial bin and close the trace
    FinishTrace,
    Notify(Notice),
}

/// Drives one sweep from beacon to return-home.
///
/// Owns the waypoint list and the settings snapshot the sweep started with.
pub struct Sequencer {
    settings: Arc<Settings>,
    waypoints: Vec<Waypoint>,
    state: SequencerState,
    started_at: Option<Instant>,
}

impl Sequencer {
    pub fn new(settings: Arc<Settings>, waypoints: Vec<Waypoint>) -> Self {
        Self {
            settings,
            waypoints,
            state: SequencerState::Idle,
            started_at: None,
        }
    }

    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn is_idle(&self) -> bool {
        self.state == SequencerState::Idle
    }

    /// Telemetry in these states feeds the trace.
    pub fn is_logging(&self) -> bool {
        matches!(
            self.state,
            SequencerState::Traverse { .. } | SequencerState::ArrivalPending { .. }
        )
    }

    /// Earliest instant at which `on_tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let state_deadline = self.state.deadline();
        let overall = match (&self.state, self.overall_deadline()) {
            (SequencerState::ReturnHome { .. }, _) => None,
            (_, overall) => overall,
        };
        match (state_deadline, overall) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn overall_deadline(&self) -> Option<Instant> {
        let started = self.started_at?;
        let limit = self.settings.timing.overall_timeout()?;
        Some(started + limit)
    }

    fn transition(&mut self, next: SequencerState, actions: &mut Vec<Action>) {
        info!("Sequencer {} -> {}", self.state, next);
        self.state = next;
        actions.push(Action::Notify(Notice::StateChanged(self.state.to_string())));
    }

    fn after(now: Instant, d: Duration) -> Instant {
        now + d
    }

    /// Begin a sweep: beacon on, then tare after the beacon delay.
    ///
    /// Ignored unless idle with at least one waypoint; the session checks
    /// both before calling.
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.is_idle() || self.waypoints.is_empty() {
            warn!("Sweep start ignored in state {}", self.state);
            return actions;
        }
        self.started_at = Some(now);
        actions.push(Action::Send(Command::BeaconOn));
        let until = Self::after(now, self.settings.timing.beacon());
        self.transition(SequencerState::Beacon { until }, &mut actions);
        actions
    }

    /// Abort on request: no further commands, flush and close the trace.
    pub fn abort(&mut self, _now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_idle() {
            return actions;
        }
        warn!("Sweep aborted in state {}", self.state);
        actions.push(Action::FinishTrace);
        self.started_at = None;
        self.transition(SequencerState::Idle, &mut actions);
        actions
    }

    pub fn on_event(&mut self, event: &Event, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_idle() {
            return actions;
        }

        match event {
            Event::Emergency => {
                error!("Emergency reported by rig in state {}", self.state);
                actions.push(Action::Send(Command::Stop));
                self.fail(MotionFault::Emergency, &mut actions);
            }
            Event::OverAxisLimit => self.on_over_axis_limit(now, &mut actions),
            Event::TareDone => {
                if matches!(self.state, SequencerState::AwaitTare { .. }) {
                    self.start_motors(now, &mut actions);
                }
            }
            Event::JogDone => {
                if matches!(self.state, SequencerState::ReturnHome { .. }) {
                    self.finish_return_home(&mut actions);
                }
            }
            Event::Telemetry(frame) => {
                if matches!(self.state, SequencerState::AwaitRpmStable { .. }) {
                    self.on_rpm(frame.rpm1(), now, &mut actions);
                } else {
                    let (x, y) = frame.position_steps();
                    self.on_position(x, y, now, &mut actions);
                }
            }
            _ => {}
        }
        actions
    }

    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        if let Some(overall) = self.overall_deadline() {
            let sweeping = !matches!(
                self.state,
                SequencerState::Idle | SequencerState::SweepDone | SequencerState::ReturnHome { .. }
            );
            if sweeping && now >= overall {
                warn!("Overall sweep timeout reached in state {}", self.state);
                actions.push(Action::Notify(Notice::Fault(MotionFault::OverallTimeout)));
                self.finish_sweep(now, &mut actions);
                return actions;
            }
        }

        let Some(deadline) = self.state.deadline() else {
            return actions;
        };
        if now < deadline {
            return actions;
        }

        match self.state.clone() {
            SequencerState::Beacon { .. } => {
                actions.push(Action::Send(Command::Tare));
                let deadline = Self::after(now, self.settings.timing.tare_timeout());
                self.transition(SequencerState::AwaitTare { deadline }, &mut actions);
            }
            SequencerState::AwaitTare { .. } => {
                warn!("No 'tare done' before timeout; continuing");
                self.start_motors(now, &mut actions);
            }
            SequencerState::AwaitMotorSpin { .. } => self.await_rpm(now, &mut actions),
            SequencerState::AwaitRpmStable { stable, .. } => {
                warn!(stable, "RPM never settled before timeout; continuing");
                self.begin_pre_settle(now, &mut actions);
            }
            SequencerState::PreSettle { leg, .. } => {
                warn!("Pre-settle leg {:?} timed out; continuing", leg);
                self.advance_dither(leg, now, &mut actions);
            }
            SequencerState::Traverse { index, .. } => {
                warn!(index, "Settle timeout before arrival; finalizing point");
                self.point_done(index, now, &mut actions);
            }
            SequencerState::ArrivalPending { index, samples, .. } => {
                warn!(index, samples, "Settle timeout while sampling; finalizing point");
                self.point_done(index, now, &mut actions);
            }
            SequencerState::ReturnHome { .. } => {
                warn!("No 'jog done' before return-home timeout");
                self.finish_return_home(&mut actions);
            }
            SequencerState::Idle | SequencerState::SweepDone => {}
        }
        actions
    }

    fn start_motors(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let motors = &self.settings.motors;
        let rotors: &[u8] = if self.settings.rig.tandem { &[1, 2] } else { &[1] };
        for &motor in rotors {
            actions.push(Action::Send(Command::SetMin {
                motor,
                pwm: motors.min_pwm,
            }));
            actions.push(Action::Send(Command::SetMax {
                motor,
                pwm: motors.max_pwm,
            }));
        }
        actions.push(Action::Send(Command::SetRamp {
            ms: motors.ramp_ms,
        }));
        actions.push(Action::Send(Command::StartMotor {
            pwm1: motors.pwm1,
            pwm2: motors.pwm2,
        }));
        let until = Self::after(now, self.settings.timing.motor_spin());
        self.transition(SequencerState::AwaitMotorSpin { until }, actions);
    }

    fn await_rpm(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if self.settings.motors.rpm_stable_frames == 0 {
            self.begin_pre_settle(now, actions);
            return;
        }
        let deadline = Self::after(now, self.settings.timing.settle_timeout());
        self.transition(
            SequencerState::AwaitRpmStable {
                deadline,
                last_rpm: None,
                stable: 0,
            },
            actions,
        );
    }

    fn on_rpm(&mut self, rpm: f64, now: Instant, actions: &mut Vec<Action>) {
        let SequencerState::AwaitRpmStable {
            deadline,
            last_rpm,
            stable,
        } = self.state
        else {
            return;
        };
        let motors = &self.settings.motors;
        if rpm < motors.rpm_min {
            return;
        }
        let stable = match last_rpm {
            Some(last) if (rpm - last).abs() <= motors.rpm_stable_delta => stable + 1,
            _ => 1,
        };
        if stable >= motors.rpm_stable_frames {
            info!(rpm, "RPM stable");
            self.begin_pre_settle(now, actions);
        } else {
            self.state = SequencerState::AwaitRpmStable {
                deadline,
                last_rpm: Some(rpm),
                stable,
            };
        }
    }

    fn center(&self) -> i64 {
        self.settings.rig.x_center_steps()
    }

    fn first_y(&self) -> i64 {
        self.waypoints.first().map(|w| w.y_steps).unwrap_or(0)
    }

    fn begin_pre_settle(&mut self, now: Instant, actions: &mut Vec<Action>) {
        let dither_mm = self.settings.probe.clamped_pre_settle_mm();
        if dither_mm <= 0.0 {
            self.start_traverse(0, now, actions);
            return;
        }
        let dither_steps = (dither_mm * self.settings.rig.steps_per_mm).round() as i64;
        let target = Waypoint::new(self.center() - dither_steps, self.first_y());
        self.issue_dither(DitherLeg::Away, target, false, now, actions);
    }

    fn issue_dither(
        &mut self,
        leg: DitherLeg,
        target: Waypoint,
        retried: bool,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        actions.push(Action::Send(Command::move_to(
            target.x_steps,
            target.y_steps,
            &self.settings.rig,
        )));
        let deadline = Self::after(now, self.settings.timing.settle_timeout());
        self.transition(
            SequencerState::PreSettle {
                leg,
                target,
                deadline,
                retried,
            },
            actions,
        );
    }

    fn advance_dither(&mut self, leg: DitherLeg, now: Instant, actions: &mut Vec<Action>) {
        match leg {
            DitherLeg::Away => {
                let target = Waypoint::new(self.center(), self.first_y());
                self.issue_dither(DitherLeg::Return, target, false, now, actions);
            }
            DitherLeg::Return => self.start_traverse(0, now, actions),
        }
    }

    fn start_traverse(&mut self, index: usize, now: Instant, actions: &mut Vec<Action>) {
        if index == 0 {
            actions.push(Action::StartLogging);
        }
        self.issue_move(index, false, now, actions);
    }

    fn issue_move(&mut self, index: usize, retried: bool, now: Instant, actions: &mut Vec<Action>) {
        let Some(target) = self.waypoints.get(index).copied() else {
            self.finish_sweep(now, actions);
            return;
        };
        actions.push(Action::Send(Command::move_to(
            target.x_steps,
            target.y_steps,
            &self.settings.rig,
        )));
        actions.push(Action::Notify(Notice::PointStarted {
            index,
            total: self.waypoints.len(),
            target,
        }));
        let deadline = Self::after(now, self.settings.timing.settle_timeout());
        self.transition(
            SequencerState::Traverse {
                index,
                deadline,
                retried,
            },
            actions,
        );
    }

    fn on_position(&mut self, x: i64, y: i64, now: Instant, actions: &mut Vec<Action>) {
        let tolerance = self.settings.rig.arrival_tolerance_steps;
        let wanted = self.settings.rig.samples_per_point.max(1);

        match self.state.clone() {
            SequencerState::PreSettle { leg, target, .. } => {
                if target.reached_by(x, y, tolerance) {
                    self.advance_dither(leg, now, actions);
                }
            }
            SequencerState::Traverse {
                index,
                deadline,
                retried,
            } => {
                if !self.waypoints[index].reached_by(x, y, tolerance) {
                    return;
                }
                if wanted <= 1 {
                    self.point_done(index, now, actions);
                } else {
                    self.transition(
                        SequencerState::ArrivalPending {
                            index,
                            samples: 1,
                            deadline,
                            retried,
                        },
                        actions,
                    );
                }
            }
            SequencerState::ArrivalPending {
                index,
                samples,
                deadline,
                retried,
            } => {
                if !self.waypoints[index].reached_by(x, y, tolerance) {
                    return;
                }
                let samples = samples + 1;
                if samples >= wanted {
                    self.point_done(index, now, actions);
                } else {
                    self.state = SequencerState::ArrivalPending {
                        index,
                        samples,
                        deadline,
                        retried,
                    };
                }
            }
            _ => {}
        }
    }

    fn point_done(&mut self, index: usize, now: Instant, actions: &mut Vec<Action>) {
        actions.push(Action::Notify(Notice::PointDone { index }));
        let next = index + 1;
        if next >= self.waypoints.len() {
            self.finish_sweep(now, actions);
        } else {
            self.issue_move(next, false, now, actions);
        }
    }

    fn on_over_axis_limit(&mut self, now: Instant, actions: &mut Vec<Action>) {
        match self.state.clone() {
            SequencerState::Traverse { index, retried, .. }
            | SequencerState::ArrivalPending { index, retried, .. } => {
                actions.push(Action::Send(Command::Stop));
                if retried {
                    error!(index, "Over axis limit again; giving up");
                    self.fail(MotionFault::OverAxisLimit { index: Some(index) }, actions);
                } else {
                    warn!(index, "Over axis limit; retrying leg once");
                    self.issue_move(index, true, now, actions);
                }
            }
            SequencerState::PreSettle {
                leg,
                target,
                retried,
                ..
            } => {
                actions.push(Action::Send(Command::Stop));
                if retried {
                    error!("Over axis limit again during pre-settle; giving up");
                    self.fail(MotionFault::OverAxisLimit { index: None }, actions);
                } else {
                    warn!("Over axis limit during pre-settle; retrying leg once");
                    self.issue_dither(leg, target, true, now, actions);
                }
            }
            _ => warn!("Over axis limit reported in state {}", self.state),
        }
    }

    fn fail(&mut self, fault: MotionFault, actions: &mut Vec<Action>) {
        actions.push(Action::FinishTrace);
        actions.push(Action::Notify(Notice::Fault(fault)));
        self.started_at = None;
        self.transition(SequencerState::Idle, actions);
    }

    fn finish_sweep(&mut self, now: Instant, actions: &mut Vec<Action>) {
        actions.push(Action::FinishTrace);
        self.transition(SequencerState::SweepDone, actions);
        actions.push(Action::Notify(Notice::SweepComplete));

        let (home_x, home_y) = self.settings.rig.home_steps();
        let jog = Command::jog_to(home_x, home_y, &self.settings.rig);
        actions.push(Action::Send(Command::Stop));
        actions.push(Action::Send(jog));
        let deadline = Self::after(now, self.settings.timing.return_home_timeout());
        self.transition(SequencerState::ReturnHome { deadline }, actions);
    }

    fn finish_return_home(&mut self, actions: &mut Vec<Action>) {
        actions.push(Action::Send(Command::BeaconOff));
        actions.push(Action::Notify(Notice::ReturnedHome));
        self.started_at = None;
        self.transition(SequencerState::Idle, actions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::TelemetryFrame;

    fn settings() -> Arc<Settings> {
        let mut s = Settings::default();
        s.rig.steps_per_mm = 10.0;
        s.rig.x_center_mm = 100.0;
        s.probe.pre_settle_mm = 0.0;
        Arc::new(s)
    }

    fn at(x: i64, y: i64) -> Event {
        Event::Telemetry(TelemetryFrame::normalized(vec![x as f64, y as f64], 10))
    }

    fn spinning(rpm: f64) -> Event {
        Event::Telemetry(TelemetryFrame::normalized(
            vec![0.0, 0.0, 0.0, 0.0, rpm],
            10,
        ))
    }

    const MOTOR_SETUP: [&str; 4] = [
        "setMin|1|1000",
        "setMax|1|2000",
        "setRamp|1000",
        "startMotor|1000|1000",
    ];

    /// Feed steady RPM frames until the gate opens; returns the last batch of actions.
    fn settle_rpm(seq: &mut Sequencer, t: Instant) -> Vec<Action> {
        let frames = seq.settings.motors.rpm_stable_frames;
        let mut actions = Vec::new();
        for _ in 0..frames {
            actions = seq.on_event(&spinning(3000.0), t);
        }
        actions
    }

    fn sent(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(c) => Some(c.to_string()),
                _ => None,
            })
            .collect()
    }

    /// Drive a sequencer to Traverse(0).
    fn started(settings: Arc<Settings>, waypoints: Vec<Waypoint>) -> (Sequencer, Instant) {
        let mut seq = Sequencer::new(settings.clone(), waypoints);
        let t0 = Instant::now();
        assert_eq!(sent(&seq.start(t0)), vec!["BeaconON"]);

        let t1 = t0 + settings.timing.beacon();
        assert_eq!(sent(&seq.on_tick(t1)), vec!["tare"]);
        assert_eq!(sent(&seq.on_event(&Event::TareDone, t1)), MOTOR_SETUP);

        let t2 = t1 + settings.timing.motor_spin();
        seq.on_tick(t2);
        assert!(matches!(seq.state(), SequencerState::AwaitRpmStable { .. }));
        let actions = settle_rpm(&mut seq, t2);
        assert!(actions.contains(&Action::StartLogging));
        (seq, t2)
    }

    #[test]
    fn full_sweep_sequence() {
        let wps = vec![Waypoint::new(1000, 0), Waypoint::new(970, 0)];
        let (mut seq, t) = started(settings(), wps);
        assert!(matches!(seq.state(), SequencerState::Traverse { index: 0, .. }));
        assert!(seq.is_logging());

        let actions = seq.on_event(&at(1001, 1), t);
        assert_eq!(sent(&actions), vec!["m|970|0|200|66"]);
        assert!(matches!(seq.state(), SequencerState::Traverse { index: 1, .. }));

        let actions = seq.on_event(&at(970, 0), t);
        assert!(actions.contains(&Action::FinishTrace));
        assert!(actions.contains(&Action::Notify(Notice::SweepComplete)));
        assert_eq!(sent(&actions), vec!["stop", "j|0|0|1800|1800"]);
        assert!(matches!(seq.state(), SequencerState::ReturnHome { .. }));

        let actions = seq.on_event(&Event::JogDone, t);
        assert_eq!(sent(&actions), vec!["BeaconOFF"]);
        assert!(seq.is_idle());
    }

    #[test]
    fn tare_timeout_counts_as_success() {
        let s = settings();
        let mut seq = Sequencer::new(s.clone(), vec![Waypoint::new(1000, 0)]);
        let t0 = Instant::now();
        seq.start(t0);
        let t1 = t0 + s.timing.beacon();
        seq.on_tick(t1);

        assert!(seq.on_tick(t1 + Duration::from_millis(1)).is_empty());
        let t2 = t1 + s.timing.tare_timeout();
        assert_eq!(sent(&seq.on_tick(t2)), MOTOR_SETUP);
        assert!(matches!(seq.state(), SequencerState::AwaitMotorSpin { .. }));
    }

    #[test]
    fn pre_settle_dithers_before_first_point() {
        let mut s = (*settings()).clone();
        s.probe.pre_settle_mm = 5.0;
        let s = Arc::new(s);
        let mut seq = Sequencer::new(s.clone(), vec![Waypoint::new(1000, 30)]);
        let t0 = Instant::now();
        seq.start(t0);
        let t1 = t0 + s.timing.beacon();
        seq.on_tick(t1);
        seq.on_event(&Event::TareDone, t1);
        let t2 = t1 + s.timing.motor_spin();
        seq.on_tick(t2);

        assert_eq!(sent(&settle_rpm(&mut seq, t2)), vec!["m|950|30|200|66"]);
        assert!(!seq.is_logging());

        // Frames away from the target do nothing.
        assert!(seq.on_event(&at(990, 30), t2).is_empty());
        assert_eq!(sent(&seq.on_event(&at(951, 30), t2)), vec!["m|1000|30|200|66"]);

        let actions = seq.on_event(&at(1000, 30), t2);
        assert!(actions.contains(&Action::StartLogging));
        assert_eq!(sent(&actions), vec!["m|1000|30|200|66"]);
        assert!(seq.is_logging());
    }

    #[test]
    fn collects_samples_before_advancing() {
        let mut s = (*settings()).clone();
        s.rig.samples_per_point = 3;
        let wps = vec![Waypoint::new(1000, 0), Waypoint::new(970, 0)];
        let (mut seq, t) = started(Arc::new(s), wps);

        assert!(sent(&seq.on_event(&at(1000, 0), t)).is_empty());
        assert!(matches!(
            seq.state(),
            SequencerState::ArrivalPending { index: 0, samples: 1, .. }
        ));
        // Off-target frames are not counted.
        seq.on_event(&at(1010, 0), t);
        seq.on_event(&at(1000, 0), t);
        assert_eq!(sent(&seq.on_event(&at(1000, 0), t)), vec!["m|970|0|200|66"]);
    }

    #[test]
    fn settle_timeout_finalizes_point() {
        let s = settings();
        let wps = vec![Waypoint::new(1000, 0), Waypoint::new(970, 0)];
        let (mut seq, t) = started(s.clone(), wps);

        let deadline = seq.next_deadline().unwrap();
        assert_eq!(deadline, t + s.timing.settle_timeout());
        let actions = seq.on_tick(deadline);
        assert!(actions.contains(&Action::Notify(Notice::PointDone { index: 0 })));
        assert_eq!(sent(&actions), vec!["m|970|0|200|66"]);
    }

    #[test]
    fn over_axis_limit_retries_once_then_fails() {
        let wps = vec![Waypoint::new(1000, 0)];
        let (mut seq, t) = started(settings(), wps);

        let actions = seq.on_event(&Event::OverAxisLimit, t);
        assert_eq!(sent(&actions), vec!["stop", "m|1000|0|200|66"]);
        assert!(matches!(
            seq.state(),
            SequencerState::Traverse { index: 0, retried: true, .. }
        ));

        let actions = seq.on_event(&Event::OverAxisLimit, t);
        assert_eq!(sent(&actions), vec!["stop"]);
        assert!(actions.contains(&Action::FinishTrace));
        assert!(actions.contains(&Action::Notify(Notice::Fault(
            MotionFault::OverAxisLimit { index: Some(0) }
        ))));
        assert!(seq.is_idle());
    }

    #[test]
    fn emergency_stops_and_goes_idle() {
        let wps = vec![Waypoint::new(1000, 0)];
        let (mut seq, t) = started(settings(), wps);

        let actions = seq.on_event(&Event::Emergency, t);
        assert_eq!(sent(&actions), vec!["stop"]);
        assert!(actions.contains(&Action::Notify(Notice::Fault(MotionFault::Emergency))));
        assert!(seq.is_idle());
        assert!(seq.on_event(&at(1000, 0), t).is_empty());
    }

    #[test]
    fn abort_sends_nothing_and_closes_trace() {
        let wps = vec![Waypoint::new(1000, 0)];
        let (mut seq, t) = started(settings(), wps);

        let actions = seq.abort(t);
        assert!(sent(&actions).is_empty());
        assert!(actions.contains(&Action::FinishTrace));
        assert!(seq.is_idle());
        assert_eq!(seq.next_deadline(), None);
    }

    #[test]
    fn overall_timeout_ends_sweep() {
        let mut s = (*settings()).clone();
        s.timing.overall_timeout_ms = Some(5_000);
        s.timing.settle_timeout_ms = 60_000;
        let s = Arc::new(s);
        let mut seq = Sequencer::new(s.clone(), vec![Waypoint::new(1000, 0)]);
        let t0 = Instant::now();
        seq.start(t0);
        assert_eq!(seq.next_deadline(), Some(t0 + s.timing.beacon()));

        let t1 = t0 + s.timing.beacon();
        seq.on_tick(t1);
        assert_eq!(seq.next_deadline(), Some(t0 + Duration::from_millis(5_000)));

        let actions = seq.on_tick(t0 + Duration::from_millis(5_000));
        assert!(actions.contains(&Action::Notify(Notice::Fault(MotionFault::OverallTimeout))));
        assert!(actions.contains(&Action::FinishTrace));
        assert!(matches!(seq.state(), SequencerState::ReturnHome { .. }));
    }

    fn spun_up(settings: Arc<Settings>) -> (Sequencer, Instant) {
        let mut seq = Sequencer::new(settings.clone(), vec![Waypoint::new(1000, 0)]);
        let t0 = Instant::now();
        seq.start(t0);
        let t1 = t0 + settings.timing.beacon();
        seq.on_tick(t1);
        seq.on_event(&Event::TareDone, t1);
        let t2 = t1 + settings.timing.motor_spin();
        seq.on_tick(t2);
        (seq, t2)
    }

    #[test]
    fn ramping_rpm_holds_logging_back() {
        let (mut seq, t) = spun_up(settings());

        // Still ramping: every frame jumps by more than the allowed delta.
        for rpm in [0.0, 400.0, 1000.0, 2000.0, 3000.0, 3500.0] {
            assert!(seq.on_event(&spinning(rpm), t).is_empty());
        }
        assert!(!seq.is_logging());

        // Four more frames within 50 RPM complete a run of five.
        for rpm in [3520.0, 3490.0, 3510.0] {
            assert!(seq.on_event(&spinning(rpm), t).is_empty());
        }
        let actions = seq.on_event(&spinning(3480.0), t);
        assert!(actions.contains(&Action::StartLogging));
        assert!(seq.is_logging());
    }

    #[test]
    fn jumpy_rpm_restarts_the_stable_run() {
        let (mut seq, t) = spun_up(settings());
        for rpm in [3000.0, 3010.0, 3020.0, 3030.0, 3200.0, 3210.0, 3220.0, 3230.0] {
            assert!(seq.on_event(&spinning(rpm), t).is_empty());
        }
        assert!(matches!(
            seq.state(),
            SequencerState::AwaitRpmStable { stable: 4, .. }
        ));
        assert!(seq.on_event(&spinning(3240.0), t).contains(&Action::StartLogging));
    }

    #[test]
    fn unsettled_rpm_times_out_into_the_sweep() {
        let s = settings();
        let (mut seq, t) = spun_up(s.clone());
        let deadline = seq.next_deadline().unwrap();
        assert_eq!(deadline, t + s.timing.settle_timeout());
        assert!(seq.on_tick(deadline).contains(&Action::StartLogging));
    }

    #[test]
    fn disabled_rpm_gate_skips_straight_to_traverse() {
        let mut s = (*settings()).clone();
        s.motors.rpm_stable_frames = 0;
        let (seq, _) = spun_up(Arc::new(s));
        assert!(seq.is_logging());
    }

    #[test]
    fn tandem_rig_gets_limits_for_both_rotors() {
        let mut s = (*settings()).clone();
        s.rig.tandem = true;
        s.motors.min_pwm = 1100;
        s.motors.max_pwm = 1900;
        s.motors.ramp_ms = 250;
        let s = Arc::new(s);
        let mut seq = Sequencer::new(s.clone(), vec![Waypoint::new(1000, 0)]);
        let t0 = Instant::now();
        seq.start(t0);
        let t1 = t0 + s.timing.beacon();
        seq.on_tick(t1);
        assert_eq!(
            sent(&seq.on_event(&Event::TareDone, t1)),
            vec![
                "setMin|1|1100",
                "setMax|1|1900",
                "setMin|2|1100",
                "setMax|2|1900",
                "setRamp|250",
                "startMotor|1000|1000",
            ]
        );
    }

    #[test]
    fn returns_to_configured_home_corner() {
        let mut s = (*settings()).clone();
        s.rig.home_x_mm = 5.0;
        s.rig.home_y_mm = 80.0;
        let (mut seq, t) = started(Arc::new(s), vec![Waypoint::new(1000, 0)]);

        let actions = seq.on_event(&at(1000, 0), t);
        assert_eq!(sent(&actions), vec!["stop", "j|50|800|1800|1800"]);
        assert!(matches!(seq.state(), SequencerState::ReturnHome { .. }));
    }

    #[test]
    fn start_requires_idle_and_waypoints() {
        let mut seq = Sequencer::new(settings(), Vec::new());
        assert!(seq.start(Instant::now()).is_empty());
        assert!(seq.is_idle());
    }

    #[test]
    fn faults_map_onto_error_variants() {
        assert!(matches!(
            DaqError::from(MotionFault::Emergency),
            DaqError::EmergencyStop
        ));
        let err = DaqError::from(MotionFault::OverAxisLimit { index: Some(4) });
        assert_eq!(
            err.to_string(),
            "Motion fault: over axis limit at waypoint 4 after retry"
        );
    }
}
