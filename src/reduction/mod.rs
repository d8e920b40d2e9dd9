//! Offline reduction of a finished trace.
//!
//! The trace is re-aggregated into 3 mm radial bands out to the blade tip
//! plus margin. Each band is joined against the blade geometry table and run
//! through the blade-element kinematics in [`aero`]; the band means then feed
//! the momentum summary in [`momentum`]. Output goes to `<trace>_mean.csv`:
//! one row per band, a blank line, then named summary rows.
//!
//! The pass only reads the trace, so it can run on a file still being
//! appended to by another process, and running it twice yields the same
//! numbers.

pub mod aero;
pub mod center_of_thrust;
pub mod geometry;
pub mod momentum;

use crate::config::{PropellerConfig, Settings};
use crate::data::trace::{read_trace, TraceRow, TraceTable};
use crate::error::{AppResult, DaqError};
use aero::{chord_effective, reynolds, section_kinematics, ChordEffective, SectionKinematics};
use geometry::BladeGeometry;
use momentum::{MomentumInputs, PerformanceSummary, RotorSummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Radial band width of the reduction, mm.
pub const BAND_MM: f64 = 3.0;

pub const REDUCED_COLUMNS: [&str; 26] = [
    "samples",
    "prop_inch",
    "dr_ratio",
    "x_mm",
    "y_mm",
    "torque1_Nm",
    "thrust1_N",
    "airspeed_mps",
    "aoa_deg",
    "aoss_deg",
    "v_tan_mps",
    "v_rad_mps",
    "v_axial_mps",
    "chord_angle_deg",
    "chord_angle_eff_deg",
    "chord_length_mm",
    "chord_length_eff_mm",
    "helix_angle_eff_deg",
    "alpha_angle_deg",
    "v_total_mps",
    "v_lift_mps",
    "v_drag_mps",
    "CL",
    "CD",
    "Re",
    "v_a+r_mps",
];

pub const REDUCED_TANDEM_COLUMNS: [&str; 2] = ["torque2_Nm", "thrust2_N"];

/// Physical inputs of the reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionParams {
    pub radius_mm: f64,
    pub safety_over_prop_pct: f64,
    /// Bin width the trace was acquired with; enters the induced velocity
    pub x_delta_mm: f64,
    pub rho: f64,
    /// Kinematic viscosity, units of 1e-5 m²/s
    pub kin_visc: f64,
}

impl ReductionParams {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            radius_mm: settings.propeller.radius_mm(),
            safety_over_prop_pct: settings.propeller.safety_over_prop_pct,
            x_delta_mm: settings.probe.x_delta_mm,
            rho: settings.air.rho,
            kin_visc: settings.air.kin_visc,
        }
    }

    pub fn with_radius_mm(mut self, radius_mm: f64) -> Self {
        self.radius_mm = radius_mm;
        self
    }

    pub fn with_rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    pub fn with_kin_visc(mut self, kin_visc: f64) -> Self {
        self.kin_visc = kin_visc;
        self
    }

    pub fn with_safety_pct(mut self, pct: f64) -> Self {
        self.safety_over_prop_pct = pct;
        self
    }

    /// Outermost band station, `3·floor((R + margin)/3)` mm.
    pub fn max_station_mm(&self) -> i64 {
        let margin = PropellerConfig::margin_factor(self.safety_over_prop_pct);
        (BAND_MM * ((self.radius_mm + margin) / BAND_MM).floor()) as i64
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_mm / 1000.0
    }
}

/// Statistical mode. Ties go to the value seen first; empty input gives 0.
pub fn omega_mode(values: &[f64]) -> f64 {
    let mut counts: Vec<(u64, usize)> = Vec::new();
    for v in values {
        let bits = v.to_bits();
        match counts.iter_mut().find(|(b, _)| *b == bits) {
            Some((_, n)) => *n += 1,
            None => counts.push((bits, 1)),
        }
    }
    let mut best: Option<(u64, usize)> = None;
    for &(bits, n) in &counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((bits, n));
        }
    }
    best.map(|(bits, _)| f64::from_bits(bits)).unwrap_or(0.0)
}

/// Means of every trace column over one radial band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BandMeans {
    pub station_mm: i64,
    pub samples: usize,
    pub prop_inch: f64,
    pub dr_ratio: f64,
    pub x_mm: f64,
    pub y_mm: f64,
    pub torque1: f64,
    pub thrust1: f64,
    pub airspeed: f64,
    pub aoa: f64,
    pub aoss: f64,
    pub v_tan: f64,
    pub v_rad: f64,
    pub v_axial: f64,
    pub torque2: f64,
    pub thrust2: f64,
}

/// Group rows into bands by nearest station, `round(x/3)·3`, and average
/// them. Bands beyond `max_station_mm` are dropped.
pub fn band_means(rows: &[TraceRow], max_station_mm: i64) -> Vec<BandMeans> {
    let mut bands: BTreeMap<i64, Vec<&TraceRow>> = BTreeMap::new();
    for row in rows {
        let station = ((row.x_mm / BAND_MM).round() * BAND_MM) as i64;
        if (0..=max_station_mm).contains(&station) {
            bands.entry(station).or_default().push(row);
        }
    }

    bands
        .into_iter()
        .map(|(station, members)| {
            let n = members.len() as f64;
            let mean = |f: fn(&TraceRow) -> f64| members.iter().map(|&r| f(r)).sum::<f64>() / n;
            BandMeans {
                station_mm: station,
                samples: members.iter().map(|r| r.samples.max(1)).sum(),
                prop_inch: mean(|r| r.prop_inch),
                dr_ratio: mean(|r| r.dr_ratio),
                x_mm: mean(|r| r.x_mm),
                y_mm: mean(|r| r.y_mm),
                torque1: mean(|r| r.torque1_nm),
                thrust1: mean(|r| r.thrust1_n),
                airspeed: mean(|r| r.airspeed),
                aoa: mean(|r| r.aoa_deg),
                aoss: mean(|r| r.aoss_deg),
                v_tan: mean(|r| r.v_tan),
                v_rad: mean(|r| r.v_rad),
                v_axial: mean(|r| r.v_axial),
                torque2: mean(|r| r.torque2_nm),
                thrust2: mean(|r| r.thrust2_n),
            }
        })
        .collect()
}

/// One output row of the reduced trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReducedRow {
    pub band: BandMeans,
    pub chord_angle_deg: f64,
    pub chord_length_mm: f64,
    pub chord: ChordEffective,
    pub kinematics: SectionKinematics,
    pub reynolds: f64,
    /// Axial plus radial speed, `sqrt(v_ax² + v_rad²)`
    pub v_ar: f64,
}

fn dec(v: f64, decimals: usize) -> String {
    format!("{:.*}", decimals, v)
}

impl ReducedRow {
    pub fn header(tandem: bool) -> Vec<&'static str> {
        let mut cols = REDUCED_COLUMNS.to_vec();
        if tandem {
            cols.extend_from_slice(&REDUCED_TANDEM_COLUMNS);
        }
        cols
    }

    pub fn to_record(&self, tandem: bool) -> Vec<String> {
        let b = &self.band;
        let k = &self.kinematics;
        let mut rec = vec![
            b.samples.to_string(),
            dec(b.prop_inch, 3),
            dec(b.dr_ratio, 1),
            b.station_mm.to_string(),
            dec(b.y_mm, 0),
            dec(b.torque1, 4),
            dec(b.thrust1, 4),
            dec(b.airspeed, 2),
            dec(b.aoa, 2),
            dec(b.aoss, 2),
            dec(b.v_tan, 2),
            dec(b.v_rad, 2),
            dec(b.v_axial, 2),
            dec(self.chord_angle_deg, 2),
            dec(self.chord.angle_deg, 2),
            dec(self.chord_length_mm, 2),
            dec(self.chord.length_mm, 2),
            dec(k.helix_angle_deg, 2),
            dec(k.alpha_deg, 2),
            dec(k.total_speed, 2),
            dec(k.v_lift, 2),
            dec(k.v_drag, 2),
            dec(k.cl, 3),
            dec(k.cd, 3),
            dec(self.reynolds, 0),
            dec(self.v_ar, 2),
        ];
        if tandem {
            rec.push(dec(b.torque2, 4));
            rec.push(dec(b.thrust2, 4));
        }
        rec
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionReport {
    pub rows: Vec<ReducedRow>,
    pub summary: PerformanceSummary,
    /// Rotor 2 metrics on tandem traces
    pub rotor2: Option<RotorSummary>,
    pub rho: f64,
    pub kin_visc: f64,
    pub output: Option<PathBuf>,
}

impl ReductionReport {
    pub fn is_tandem(&self) -> bool {
        self.rotor2.is_some()
    }

    /// Named summary rows as written after the band table.
    pub fn summary_rows(&self) -> Vec<(&'static str, String, &'static str)> {
        let s = &self.summary;
        let mut rows = vec![
            ("Omega", dec(s.omega, 2), "rad/s"),
            ("Induced_power", dec(s.induced_power, 2), "W"),
            ("Power", dec(s.power, 2), "W"),
            ("Efficiency", dec(s.efficiency_pct, 2), "%"),
            ("Average_induced_speed", dec(s.induced_velocity, 2), "m/s"),
            ("Airspeed_ratio", dec(s.airspeed_ratio, 2), ""),
            ("V_mass", dec(s.mass_flow, 2), "kg/s"),
            ("V_max_mean", dec(s.v_max_mean, 2), "m/s"),
            ("Ct", dec(s.ct, 7), ""),
            ("Cp", dec(s.cp, 7), ""),
        ];
        if let Some(r2) = &self.rotor2 {
            rows.push(("Omega2", dec(r2.omega, 2), "rad/s"));
            rows.push(("Power2", dec(r2.power, 2), "W"));
            rows.push(("Ct2", dec(r2.ct, 7), ""));
            rows.push(("Cp2", dec(r2.cp, 7), ""));
        }
        rows.push(("Air_density", dec(self.rho, 3), "kg/m3"));
        rows.push(("Air_kinematic_viscosity", dec(self.kin_visc, 2), "1e-5 m2/s"));
        rows
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Reduce an already parsed trace.
pub fn reduce_table(
    table: &TraceTable,
    geometry: &BladeGeometry,
    params: &ReductionParams,
) -> AppResult<ReductionReport> {
    if table.rows.is_empty() {
        return Err(DaqError::Processing("trace has no data rows".to_string()));
    }

    let omega1: Vec<f64> = table.rows.iter().map(|r| r.omega1).collect();
    let omega = omega_mode(&omega1);
    let bands = band_means(&table.rows, params.max_station_mm());
    debug!(
        bands = bands.len(),
        omega,
        max_station_mm = params.max_station_mm(),
        "Reducing trace"
    );

    let mut axial_moment = 0.0;
    let rows: Vec<ReducedRow> = bands
        .into_iter()
        .map(|band| {
            let x_m = band.x_mm / 1000.0;
            axial_moment += x_m * band.v_axial;

            let (chord_angle_deg, chord_length_mm) = geometry.lookup(band.station_mm);
            let chord = chord_effective(
                omega,
                x_m,
                band.v_tan,
                band.v_rad,
                chord_angle_deg,
                chord_length_mm,
            );
            let kinematics = section_kinematics(
                omega,
                x_m,
                band.v_tan,
                band.v_rad,
                band.v_axial,
                chord.angle_deg,
            );
            ReducedRow {
                band,
                chord_angle_deg,
                chord_length_mm,
                chord,
                kinematics,
                reynolds: reynolds(chord.length_mm, kinematics.total_speed, params.kin_visc),
                v_ar: band.v_axial.hypot(band.v_rad),
            }
        })
        .collect();

    let summary = PerformanceSummary::compute(&MomentumInputs {
        radius_m: params.radius_m(),
        band_width_m: params.x_delta_mm / 1000.0,
        axial_moment,
        mean_thrust: mean(rows.iter().map(|r| r.band.thrust1)),
        mean_torque: mean(rows.iter().map(|r| r.band.torque1)),
        omega,
        rho: params.rho,
    });

    let rotor2 = table.tandem.then(|| {
        let omega2: Vec<f64> = table.rows.iter().map(|r| r.omega2).collect();
        RotorSummary::compute(
            mean(rows.iter().map(|r| r.band.thrust2)),
            mean(rows.iter().map(|r| r.band.torque2)),
            omega_mode(&omega2),
            params.rho,
            params.radius_m(),
        )
    });

    Ok(ReductionReport {
        rows,
        summary,
        rotor2,
        rho: params.rho,
        kin_visc: params.kin_visc,
        output: None,
    })
}

/// `<stem>_mean.csv` next to the trace.
pub fn reduced_path(trace: &Path) -> PathBuf {
    let stem = trace
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trace".to_string());
    trace.with_file_name(format!("{}_mean.csv", stem))
}

/// Write the band table, a blank line and the summary rows. Overwrites.
pub fn write_reduced(path: &Path, report: &ReductionReport) -> AppResult<()> {
    let tandem = report.is_tandem();
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)?;
    writer.write_record(ReducedRow::header(tandem))?;
    for row in &report.rows {
        writer.write_record(row.to_record(tandem))?;
    }
    writer.flush()?;

    let mut file: File = writer
        .into_inner()
        .map_err(|e| DaqError::Io(e.into_error()))?;
    file.write_all(b"\n")?;

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(file);
    for (name, value, unit) in report.summary_rows() {
        writer.write_record([name, value.as_str(), unit])?;
    }
    writer.flush()?;
    Ok(())
}

/// Read `trace`, reduce it and write `<stem>_mean.csv` beside it.
pub fn reduce_trace(
    trace: &Path,
    geometry: &BladeGeometry,
    params: &ReductionParams,
) -> AppResult<ReductionReport> {
    let table = read_trace(trace)?;
    let mut report = reduce_table(&table, geometry, params)?;
    let out = reduced_path(trace);
    write_reduced(&out, &report)?;
    info!(
        bands = report.rows.len(),
        efficiency = report.summary.efficiency_pct,
        ct = report.summary.ct,
        "Reduced '{}' into '{}'",
        trace.display(),
        out.display()
    );
    report.output = Some(out);
    Ok(report)
}
