//! Command line front end for the propeller wake stand.
//!
//! Subcommands:
//! - `sweep`: run a probe sweep on the rig (or the simulated rig) and write a trace
//! - `reduce`: turn a trace into blade-section and rotor performance figures
//! - `center-of-thrust`: combine the 0 R and 0.8 R reduced traces
//! - `config`: print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use propstand_daq::adapters::SerialAdapter;
use propstand_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use propstand_daq::data::storage::default_trace_name;
use propstand_daq::error::DaqError;
use propstand_daq::hardware::mock::{spawn_mock_rig, MockRigConfig};
use propstand_daq::messages::SessionEvent;
use propstand_daq::reduction::center_of_thrust::center_of_thrust_files;
use propstand_daq::reduction::geometry::BladeGeometry;
use propstand_daq::reduction::{reduce_trace, ReductionParams, ReductionReport};
use propstand_daq::session::{spawn_session, SessionHandle};
use propstand_daq::trajectory::{load_trajectory, radial_sweep, Waypoint};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Propeller wake probe acquisition and reduction
#[derive(Parser, Debug)]
#[command(name = "propstand")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a probe sweep and write the binned trace
    Sweep {
        /// Waypoint file (`x_steps y_steps` per line); default is a radial sweep
        #[arg(short, long)]
        trajectory: Option<PathBuf>,

        /// Trace file to append to; default is a timestamped file in storage.output_dir
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Y position of the default radial sweep, in steps
        #[arg(long, default_value = "0")]
        y_steps: i64,

        /// Run against the in-process simulated rig
        #[arg(long)]
        simulate: bool,

        /// Reduce the trace with this blade geometry once the sweep completes
        #[arg(long)]
        geometry: Option<PathBuf>,
    },

    /// Reduce a trace into `<trace>_mean.csv`
    Reduce {
        /// Trace written by `sweep`
        trace: PathBuf,

        /// Blade geometry file (`x_mm angle_deg chord_mm` per line)
        #[arg(short, long)]
        geometry: PathBuf,

        /// Air density override in kg/m3
        #[arg(long)]
        rho: Option<f64>,

        /// Kinematic viscosity override, units of 1e-5 m2/s
        #[arg(long)]
        kin_visc: Option<f64>,

        /// Propeller diameter override in inches
        #[arg(long)]
        diameter_inch: Option<f64>,

        /// Safety margin past the tip override, percent
        #[arg(long)]
        safety_pct: Option<f64>,

        /// Print the full report as JSON instead of the summary table
        #[arg(long)]
        json: bool,
    },

    /// Compute the center of thrust from the 0 R and 0.8 R reduced traces
    CenterOfThrust {
        /// Reduced trace taken with the probe at 0 R
        zero_r: PathBuf,

        /// Reduced trace taken with the probe at 0.8 R
        point_eight_r: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = Settings::load_from(&args.config)
        .with_context(|| format!("Failed to load configuration from '{}'", args.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    match args.command {
        Cmd::Sweep {
            trajectory,
            trace,
            y_steps,
            simulate,
            geometry,
        } => {
            let waypoints = match trajectory {
                Some(path) => load_trajectory(&path).with_context(|| {
                    format!("Failed to load trajectory '{}'", path.display())
                })?,
                None => radial_sweep(&settings, y_steps),
            };
            let trace = trace.unwrap_or_else(|| {
                settings.storage.output_dir.join(default_trace_name())
            });
            run_sweep(&settings, waypoints, &trace, simulate).await?;
            if let Some(geometry) = geometry {
                let params = ReductionParams::from_settings(&settings);
                let report = reduce(&trace, &geometry, &params)?;
                print_report(&report, false)?;
            }
        }
        Cmd::Reduce {
            trace,
            geometry,
            rho,
            kin_visc,
            diameter_inch,
            safety_pct,
            json,
        } => {
            let mut params = ReductionParams::from_settings(&settings);
            if let Some(rho) = rho {
                params = params.with_rho(rho);
            }
            if let Some(kin_visc) = kin_visc {
                params = params.with_kin_visc(kin_visc);
            }
            if let Some(inch) = diameter_inch {
                params = params.with_radius_mm(inch * 25.4 / 2.0);
            }
            if let Some(pct) = safety_pct {
                params = params.with_safety_pct(pct);
            }
            let report = reduce(&trace, &geometry, &params)?;
            print_report(&report, json)?;
        }
        Cmd::CenterOfThrust {
            zero_r,
            point_eight_r,
            json,
        } => {
            let (cot, path) = center_of_thrust_files(
                &zero_r,
                &point_eight_r,
                settings.air.rho,
                settings.propeller.radius_mm() / 1000.0,
            )
            .context("Center of thrust computation failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&cot)?);
                return Ok(());
            }
            println!("Thrust moment:           {:.4} Nm", cot.thrust_moment);
            println!("Center of thrust radius: {:.4} m", cot.radius_m);
            println!("Center of thrust:        {:.2} %", cot.percent);
            println!("Written to {}", path.display());
        }
        Cmd::Config => {
            print!("{}", settings.to_toml()?);
        }
    }

    Ok(())
}

fn reduce(trace: &Path, geometry: &Path, params: &ReductionParams) -> Result<ReductionReport> {
    let geometry = BladeGeometry::load(geometry)
        .with_context(|| format!("Failed to load blade geometry '{}'", geometry.display()))?;
    if geometry.is_empty() {
        warn!("Blade geometry is empty; chord columns will be zero");
    }
    reduce_trace(trace, &geometry, params)
        .with_context(|| format!("Failed to reduce '{}'", trace.display()))
}

fn print_report(report: &ReductionReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for (name, value, unit) in report.summary_rows() {
        println!("{:<24} {:>12} {}", name, value, unit);
    }
    if let Some(path) = &report.output {
        println!("Written to {}", path.display());
    }
    Ok(())
}

async fn run_sweep(
    settings: &Settings,
    waypoints: Vec<Waypoint>,
    trace: &Path,
    simulate: bool,
) -> Result<()> {
    let shared = Arc::new(settings.clone());
    let session = if simulate {
        info!("Using the simulated rig");
        let (link, _rig) = spawn_mock_rig(MockRigConfig::from_settings(settings));
        spawn_session(shared, link)
    } else {
        settings.require_serial_port()?;
        let link = SerialAdapter::from_config(&settings.serial)
            .open()
            .context("Failed to open the rig serial port")?;
        spawn_session(shared, link)
    };

    let mut events = session.subscribe();
    let total = waypoints.len();
    session
        .start_sweep(waypoints, trace.to_path_buf())
        .await
        .context("Failed to start the sweep")?;
    info!(points = total, "Sweep started, writing '{}'", trace.display());

    let outcome = follow_sweep(&session, &mut events).await;
    session.shutdown().await?;
    outcome
}

/// Wait until the rig is back home, a fault ends the sweep, or Ctrl-C.
async fn follow_sweep(
    session: &SessionHandle,
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> Result<()> {
    let mut fault = None;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, aborting sweep");
                session.abort().await?;
                bail!("Sweep aborted by user");
            }
        };

        match event {
            Ok(SessionEvent::PointStarted {
                index,
                total,
                target,
            }) => info!(index, total, x_steps = target.x_steps, "Moving to point"),
            Ok(SessionEvent::SweepComplete { trace, rows }) => {
                info!(rows, "Sweep complete, trace '{}'", trace.display());
            }
            Ok(SessionEvent::Fault(f)) => {
                error!("Sweep fault: {}", f);
                fault = Some(f);
            }
            Ok(SessionEvent::ReturnedHome) => {
                return match fault.take() {
                    Some(f) => Err(DaqError::from(f)).context("Sweep cut short"),
                    None => Ok(()),
                };
            }
            Ok(SessionEvent::State(state)) if state == "Idle" => {
                if let Some(f) = fault.take() {
                    return Err(DaqError::from(f)).context("Sweep stopped");
                }
            }
            Ok(SessionEvent::Disconnected) => bail!("Rig link closed during the sweep"),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("Dropped {} session events", n),
            Err(RecvError::Closed) => bail!("Session stopped unexpectedly"),
        }
    }
}
