//! Spatial binning of telemetry into trace rows.
//!
//! Frames are binned by absolute probe displacement from the scan center,
//! `|x − center|` in steps. The first frame of a run produces a baseline row
//! at 0 mm. After that a bin is flushed each time the displacement reaches the
//! next multiple of Δx; its frames are averaged element-wise and turned into
//! physical quantities:
//!
//! - thrust mN → N, torque N·mm → N·m, RPM → rad/s (ω = 2πN/60)
//! - signed AoA = mount_sign · (aoa_raw + rotation_dir · |aoa_abs|)
//! - v_tan = V·sin(AoA), v_rad = V·cos(AoA)·sin(AoSS), v_axial = V·cos(AoA)·cos(AoSS)
//!
//! Rows carry the probe position measured when the bin closed. When one frame
//! jumps across several edges, the rows for the edges it skipped are placed on
//! those edges and only the last takes the measured position.

use crate::config::Settings;
use crate::data::frame::TelemetryFrame;
use crate::data::trace::TraceRow;
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::debug;

/// RPM to rad/s.
pub fn omega_from_rpm(rpm: f64) -> f64 {
    rpm * 2.0 * PI / 60.0
}

/// Angle-of-attack with the rig's rotation and mount sign conventions applied.
pub fn signed_aoa(aoa_raw: f64, aoa_abs: f64, rotation_dir: i32, mount_sign: i32) -> f64 {
    f64::from(mount_sign) * (aoa_raw + f64::from(rotation_dir) * aoa_abs.abs())
}

/// Tangential, radial and axial flow components from airspeed and angles.
pub fn velocity_triangle(airspeed: f64, aoa_deg: f64, aoss_deg: f64) -> (f64, f64, f64) {
    let aoa = aoa_deg.to_radians();
    let aoss = aoss_deg.to_radians();
    (
        airspeed * aoa.sin(),
        airspeed * aoa.cos() * aoss.sin(),
        airspeed * aoa.cos() * aoss.cos(),
    )
}

/// Turns a telemetry stream into one `TraceRow` per Δx of radial travel.
///
/// Feed frames with `push` while the sweep is logging and call `finish` when
/// it ends to flush the partial bin.
pub struct SpatialAggregator {
    settings: Arc<Settings>,
    center_steps: i64,
    bin_delta_steps: i64,
    bin: Vec<TelemetryFrame>,
    bins_logged: i64,
    y0_steps: Option<i64>,
    last_frame: Option<TelemetryFrame>,
}

impl SpatialAggregator {
    pub fn new(settings: Arc<Settings>) -> Self {
        let spmm = settings.rig.steps_per_mm;
        let bin_delta_steps = ((settings.probe.x_delta_mm * spmm).round() as i64).max(1);
        Self {
            center_steps: settings.rig.x_center_steps(),
            bin_delta_steps,
            settings,
            bin: Vec::new(),
            bins_logged: 0,
            y0_steps: None,
            last_frame: None,
        }
    }

    pub fn bin_delta_steps(&self) -> i64 {
        self.bin_delta_steps
    }

    /// Forget everything; the next frame starts a new run with a baseline.
    pub fn reset(&mut self) {
        self.bin.clear();
        self.bins_logged = 0;
        self.y0_steps = None;
        self.last_frame = None;
    }

    /// Feed one frame, returning the rows it completes (baseline and/or bins).
    pub fn push(&mut self, frame: TelemetryFrame) -> Vec<TraceRow> {
        let mut rows = Vec::new();
        let (x, y) = frame.position_steps();

        if self.y0_steps.is_none() {
            self.y0_steps = Some(y);
            let mut baseline = self.row_from(&frame, 1, x, y);
            baseline.x_mm = 0.0;
            rows.push(baseline);
        }

        self.bin.push(frame.clone());
        self.last_frame = Some(frame);

        let crossed = (x - self.center_steps).abs() / self.bin_delta_steps;
        let side = if x < self.center_steps { -1 } else { 1 };
        while self.bins_logged < crossed {
            let edge = self.bins_logged + 1;
            let at_x = if edge < crossed {
                self.center_steps + side * edge * self.bin_delta_steps
            } else {
                x
            };
            rows.push(self.flush_bin(at_x, y));
        }
        rows
    }

    /// Average and clear the current bin. An empty bin reuses the most
    /// recent frame.
    fn flush_bin(&mut self, x: i64, y: i64) -> TraceRow {
        let samples = self.bin.len();
        let averaged = TelemetryFrame::mean(&self.bin)
            .or_else(|| self.last_frame.clone())
            .unwrap_or_else(|| TelemetryFrame::normalized(Vec::new(), self.settings.rig.frame_arity()));
        self.bins_logged += 1;
        self.bin.clear();
        debug!(bin = self.bins_logged, samples, x_steps = x, "Flushing bin");
        self.row_from(&averaged, samples.max(1), x, y)
    }

    /// Flush a partial bin at sweep end using the last known position.
    pub fn finish(&mut self) -> Option<TraceRow> {
        if self.bin.is_empty() {
            return None;
        }
        let (x, y) = self.last_frame.as_ref()?.position_steps();
        let samples = self.bin.len();
        let averaged = TelemetryFrame::mean(&self.bin)?;
        self.bin.clear();
        debug!(samples, x_steps = x, "Flushing tail bin");
        Some(self.row_from(&averaged, samples, x, y))
    }

    fn row_from(&self, frame: &TelemetryFrame, samples: usize, x: i64, y: i64) -> TraceRow {
        let s = &self.settings;
        let spmm = s.rig.steps_per_mm;

        let mut x_mm = (x - self.center_steps).abs() as f64 / spmm;
        if x_mm < 0.5 {
            x_mm = 0.0;
        }
        let y0 = self.y0_steps.unwrap_or(y);
        let y_mm = (y - y0) as f64 / spmm;

        let aoa = signed_aoa(
            frame.aoa_raw(),
            frame.aoa_abs(),
            s.probe.rotation_dir,
            s.probe.mount_sign,
        );
        let aoss = frame.aoss_abs();
        let (v_tan, v_rad, v_axial) = velocity_triangle(frame.airspeed(), aoa, aoss);

        let mut row = TraceRow {
            samples,
            prop_inch: s.propeller.diameter_inch,
            dr_ratio: s.propeller.dr_ratio,
            x_mm: x_mm.round(),
            y_mm: y_mm.round(),
            torque1_nm: frame.torque1_nmm() / 1000.0,
            thrust1_n: frame.thrust1_mn() / 1000.0,
            omega1: omega_from_rpm(frame.rpm1()),
            airspeed: frame.airspeed(),
            aoa_deg: aoa,
            aoss_deg: aoss,
            v_tan,
            v_rad,
            v_axial,
            ..TraceRow::default()
        };
        if s.rig.tandem {
            row.torque2_nm = frame.torque2_nmm() / 1000.0;
            row.thrust2_n = frame.thrust2_mn() / 1000.0;
            row.omega2 = omega_from_rpm(frame.rpm2());
        }
        row
    }
}
