//! Sweep session actor.
//!
//! One task owns the telemetry link, the motion sequencer, the spatial
//! aggregator and the trace writer. It reacts to three sources in a single
//! `select!` loop:
//!
//! - commands from the front end (`SessionCommand`)
//! - lines from the rig
//! - the sequencer's next deadline
//!
//! The sequencer and aggregator are plain state machines; the actor carries
//! out the `Action`s they return and publishes `SessionEvent`s on a broadcast
//! channel. Settings are snapshotted when a sweep starts and never refreshed
//! mid-sweep.

use crate::adapters::TelemetryLink;
use crate::config::Settings;
use crate::data::aggregator::SpatialAggregator;
use crate::data::frame::TelemetryFrame;
use crate::data::storage::TraceWriter;
use crate::error::{AppResult, DaqError};
use crate::messages::{SessionCommand, SessionEvent};
use crate::protocol::{parse_line, Command, Event};
use crate::sequencer::{Action, Notice, Sequencer};
use crate::trajectory::Waypoint;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Actor that owns the live link and one sweep at a time
pub struct SessionActor<T> {
    settings: Arc<Settings>,
    /// Snapshot taken when the current sweep started
    sweep_settings: Option<Arc<Settings>>,
    link: TelemetryLink<T>,
    sequencer: Option<Sequencer>,
    aggregator: Option<SpatialAggregator>,
    writer: Option<TraceWriter>,
    /// Path and row count of the trace closed most recently
    last_trace: Option<(PathBuf, usize)>,
    events: broadcast::Sender<SessionEvent>,
}

impl<T> SessionActor<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(settings: Arc<Settings>, link: TelemetryLink<T>) -> Self {
        let (events, _) = broadcast::channel(settings.application.broadcast_capacity.max(1));
        Self {
            settings,
            sweep_settings: None,
            link,
            sequencer: None,
            aggregator: None,
            writer: None,
            last_trace: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    fn sweeping(&self) -> bool {
        self.sequencer.as_ref().is_some_and(|s| !s.is_idle())
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Runs the actor event loop until shutdown or the command channel closes
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        info!("SessionActor started");

        loop {
            let deadline = self.sequencer.as_ref().and_then(Sequencer::next_deadline);
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let connected = self.link.is_connected();

            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        info!("Command channel closed");
                        self.abort_sweep().await;
                        break;
                    };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                line = self.link.next_line(), if connected => {
                    if let Some(line) = line {
                        self.handle_line(&line).await;
                    }
                }
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    if let Some(sequencer) = self.sequencer.as_mut() {
                        let actions = sequencer.on_tick(Instant::now());
                        self.execute(actions).await;
                    }
                }
            }

            // Read EOF and failed writes both land here.
            if connected && !self.link.is_connected() {
                self.on_disconnected().await;
            }
        }

        info!("SessionActor shutting down");
    }

    /// Returns true when the actor should exit.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::StartSweep {
                waypoints,
                trace_path,
                response,
            } => {
                let result = self.start_sweep(waypoints, &trace_path).await;
                let _ = response.send(result);
            }

            SessionCommand::Abort { response } => {
                self.abort_sweep().await;
                let _ = response.send(());
            }

            SessionCommand::SendCommand { command, response } => {
                let result = self.send(&command).await;
                let _ = response.send(result);
            }

            SessionCommand::UpdateSettings { settings, response } => {
                let result = settings.validate().map(|()| {
                    if self.sweeping() {
                        info!("Settings updated; the running sweep keeps its snapshot");
                    }
                    self.settings = Arc::new(settings);
                });
                let _ = response.send(result);
            }

            SessionCommand::Shutdown { response } => {
                info!("Shutdown command received");
                self.abort_sweep().await;
                let _ = response.send(());
                return true;
            }
        }
        false
    }

    async fn start_sweep(&mut self, waypoints: Vec<Waypoint>, trace_path: &Path) -> AppResult<()> {
        if self.sweeping() {
            return Err(DaqError::SweepInProgress);
        }
        if waypoints.is_empty() {
            return Err(DaqError::NoWaypoints);
        }
        if !self.link.is_connected() {
            return Err(DaqError::SerialPortNotConnected);
        }

        let snapshot = Arc::clone(&self.settings);
        let writer = TraceWriter::open(trace_path, snapshot.rig.tandem)?;
        info!(
            waypoints = waypoints.len(),
            "Starting sweep into '{}'",
            trace_path.display()
        );

        let mut sequencer = Sequencer::new(Arc::clone(&snapshot), waypoints);
        let actions = sequencer.start(Instant::now());
        self.sequencer = Some(sequencer);
        self.aggregator = Some(SpatialAggregator::new(Arc::clone(&snapshot)));
        self.sweep_settings = Some(snapshot);
        self.writer = Some(writer);
        self.execute(actions).await;
        Ok(())
    }

    async fn abort_sweep(&mut self) {
        if let Some(sequencer) = self.sequencer.as_mut() {
            let actions = sequencer.abort(Instant::now());
            self.execute(actions).await;
        }
        // A sweep that reached SweepDone may still hold the trace open.
        self.finish_trace();
    }

    async fn handle_line(&mut self, line: &str) {
        let arity = self
            .sweep_settings
            .as_ref()
            .unwrap_or(&self.settings)
            .rig
            .frame_arity();
        let Some(event) = parse_line(line, arity) else {
            debug!("Ignoring rig line {:?}", line);
            return;
        };

        match &event {
            Event::Telemetry(frame) => {
                self.publish(SessionEvent::Telemetry(frame.clone()));
                if self.sequencer.as_ref().is_some_and(Sequencer::is_logging) {
                    self.bin_frame(frame.clone());
                }
            }
            Event::Calibration(report) => {
                self.publish(SessionEvent::Calibration(report.clone()));
            }
            other => {
                info!("Rig status: {:?}", other);
                self.publish(SessionEvent::RigStatus(other.clone()));
            }
        }

        if let Some(sequencer) = self.sequencer.as_mut() {
            let actions = sequencer.on_event(&event, Instant::now());
            self.execute(actions).await;
        }
    }

    fn bin_frame(&mut self, frame: TelemetryFrame) {
        let (Some(aggregator), Some(writer)) = (self.aggregator.as_mut(), self.writer.as_mut())
        else {
            return;
        };
        for row in aggregator.push(frame) {
            match writer.append(&row) {
                Ok(()) => {
                    let _ = self.events.send(SessionEvent::Row(row));
                }
                Err(e) => error!("Failed to append trace row: {}", e),
            }
        }
    }

    /// Flush the partial bin and close the trace. Safe to call when no
    /// trace is open.
    fn finish_trace(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        if let Some(row) = self.aggregator.as_mut().and_then(SpatialAggregator::finish) {
            match writer.append(&row) {
                Ok(()) => self.publish(SessionEvent::Row(row)),
                Err(e) => error!("Failed to append tail row: {}", e),
            }
        }
        if let Err(e) = writer.close() {
            error!("Failed to close trace '{}': {}", writer.path().display(), e);
        }
        self.last_trace = Some((writer.path().to_path_buf(), writer.rows_written()));
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(command) => {
                    if let Err(e) = self.send(&command).await {
                        warn!("Command '{}' not sent: {}", command, e);
                    }
                }
                Action::StartLogging => {
                    if let Some(aggregator) = self.aggregator.as_mut() {
                        aggregator.reset();
                    }
                }
                Action::FinishTrace => self.finish_trace(),
                Action::Notify(notice) => self.notify(notice),
            }
        }
    }

    async fn send(&mut self, command: &Command) -> AppResult<()> {
        if !self.link.is_connected() {
            debug!("Link down; dropping command '{}'", command);
            return Err(DaqError::LinkClosed);
        }
        self.link.send_line(&command.to_string()).await
    }

    fn notify(&mut self, notice: Notice) {
        let event = match notice {
            Notice::StateChanged(state) => SessionEvent::State(state),
            Notice::PointStarted {
                index,
                total,
                target,
            } => SessionEvent::PointStarted {
                index,
                total,
                target,
            },
            Notice::PointDone { index } => SessionEvent::PointDone { index },
            Notice::SweepComplete => {
                let (trace, rows) = self.last_trace.clone().unwrap_or_default();
                info!(rows, "Sweep complete; trace '{}'", trace.display());
                SessionEvent::SweepComplete { trace, rows }
            }
            Notice::ReturnedHome => SessionEvent::ReturnedHome,
            Notice::Fault(fault) => {
                error!("Sweep fault: {}", fault);
                SessionEvent::Fault(fault)
            }
        };
        self.publish(event);
    }

    async fn on_disconnected(&mut self) {
        warn!("Rig link disconnected");
        self.publish(SessionEvent::Disconnected);
        if self.sweeping() {
            self.abort_sweep().await;
        }
    }
}

/// Front-end handle to a spawned session
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    task: JoinHandle<()>,
}

/// Spawn a session actor on the current runtime.
pub fn spawn_session<T>(settings: Arc<Settings>, link: TelemetryLink<T>) -> SessionHandle
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let actor = SessionActor::new(settings, link);
    let events = actor.event_sender();
    let (commands, rx) = mpsc::channel(32);
    let task = tokio::spawn(actor.run(rx));
    SessionHandle {
        commands,
        events,
        task,
    }
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<R>(
        &self,
        (command, rx): (SessionCommand, tokio::sync::oneshot::Receiver<R>),
    ) -> AppResult<R> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DaqError::SessionClosed)?;
        rx.await.map_err(|_| DaqError::SessionClosed)
    }

    pub async fn start_sweep(&self, waypoints: Vec<Waypoint>, trace_path: PathBuf) -> AppResult<()> {
        self.request(SessionCommand::start_sweep(waypoints, trace_path))
            .await?
    }

    pub async fn abort(&self) -> AppResult<()> {
        self.request(SessionCommand::abort()).await
    }

    pub async fn send_command(&self, command: Command) -> AppResult<()> {
        self.request(SessionCommand::send_command(command)).await?
    }

    pub async fn update_settings(&self, settings: Settings) -> AppResult<()> {
        self.request(SessionCommand::update_settings(settings)).await?
    }

    /// Stop the actor and wait for it to exit.
    pub async fn shutdown(self) -> AppResult<()> {
        self.request(SessionCommand::shutdown()).await?;
        self.task.await.map_err(|_| DaqError::SessionClosed)
    }
}
