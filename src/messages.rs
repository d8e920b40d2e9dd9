//! Message types for actor-based communication
//!
//! `SessionCommand`s flow from the CLI (or any other front end) into the
//! `SessionActor` over an mpsc channel; requests that need an answer carry a
//! oneshot sender. `SessionEvent`s flow back out over a broadcast channel so
//! that any number of subscribers can follow a sweep without reaching into
//! session state.

use crate::config::Settings;
use crate::data::frame::TelemetryFrame;
use crate::data::trace::TraceRow;
use crate::error::AppResult;
use crate::protocol::{CalibrationReport, Command, Event};
use crate::sequencer::MotionFault;
use crate::trajectory::Waypoint;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Commands that can be sent to the SessionActor
#[derive(Debug)]
pub enum SessionCommand {
    /// Start a sweep over `waypoints`, appending rows to `trace_path`
    StartSweep {
        waypoints: Vec<Waypoint>,
        trace_path: PathBuf,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Abort the sweep in progress. No further rig commands are issued.
    Abort { response: oneshot::Sender<()> },

    /// Send a raw rig command (configuration, jog, calibration)
    SendCommand {
        command: Command,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Replace the settings used by the next sweep
    UpdateSettings {
        settings: Settings,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Stop the actor
    Shutdown { response: oneshot::Sender<()> },
}

impl SessionCommand {
    /// Helper to create a StartSweep command
    pub fn start_sweep(
        waypoints: Vec<Waypoint>,
        trace_path: PathBuf,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartSweep {
                waypoints,
                trace_path,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create an Abort command
    pub fn abort() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { response: tx }, rx)
    }

    /// Helper to create a SendCommand command
    pub fn send_command(command: Command) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SendCommand {
                command,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create an UpdateSettings command
    pub fn update_settings(settings: Settings) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::UpdateSettings {
                settings,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Events broadcast by the SessionActor
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Sequencer entered a new state
    State(String),
    PointStarted {
        index: usize,
        total: usize,
        target: Waypoint,
    },
    PointDone {
        index: usize,
    },
    /// A row was appended to the trace
    Row(TraceRow),
    /// Raw frame, published whether or not it was binned
    Telemetry(TelemetryFrame),
    /// Status marker from the rig (`ready!`, `homing done`, ...)
    RigStatus(Event),
    Calibration(CalibrationReport),
    SweepComplete {
        trace: PathBuf,
        rows: usize,
    },
    ReturnedHome,
    Fault(MotionFault),
    /// The link closed; the session stopped issuing commands
    Disconnected,
}
