//! Center of thrust from two reduced traces.
//!
//! The traces are taken at 0 R and 0.8 R axial offsets behind the rotor.
//! Rows are paired by position in file after truncating both to the shorter
//! length. The radial thrust-moment density `π·ρ·v_a·(v_a + Δv_a)·x²` is
//! piecewise constant in its velocity terms between stations, so the moment
//! integral is evaluated exactly segment by segment.

use crate::data::trace::{read_trace, TraceTable};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const COT_COLUMNS: [&str; 6] = [
    "x_mm",
    "v_axial_mps",
    "v_axial_08r_mps",
    "delta_va_mps",
    "diff_mass_rate_kg_s",
    "diff_thrust_N_m",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CotRow {
    pub x_mm: f64,
    pub va0: f64,
    pub va08: f64,
    pub delta_va: f64,
    pub diff_mass_rate: f64,
    pub diff_thrust: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CenterOfThrust {
    pub rows: Vec<CotRow>,
    pub rho: f64,
    pub tip_radius_m: f64,
    pub mean_thrust: f64,
    /// ∫ dT·x, N·m
    pub thrust_moment: f64,
    /// Radius of the thrust centroid, m
    pub radius_m: f64,
    /// Centroid radius as a percentage of the tip radius
    pub percent: f64,
}

/// Exact integral of `c_i·x²` over `[x_i, x_{i+1})`, summed for all
/// segments below `upper`. The density is zero past the last station.
pub fn thrust_moment(x_m: &[f64], density: &[f64], upper: f64) -> f64 {
    let n = x_m.len().min(density.len());
    let mut total = 0.0;
    for i in 0..n.saturating_sub(1) {
        let a = x_m[i];
        let b = x_m[i + 1].min(upper);
        if b > a {
            total += density[i] * (b.powi(3) - a.powi(3)) / 3.0;
        }
    }
    total
}

impl CenterOfThrust {
    /// `fallback_rho` and `fallback_radius_m` are used when the 0 R trace
    /// carries no `Air_density` row or no propeller diameter.
    pub fn compute(
        zero: &TraceTable,
        point_eight: &TraceTable,
        fallback_rho: f64,
        fallback_radius_m: f64,
    ) -> AppResult<Self> {
        let n = zero.rows.len().min(point_eight.rows.len());
        if n == 0 {
            return Err(DaqError::Processing(
                "center of thrust needs rows in both traces".to_string(),
            ));
        }
        if zero.rows.len() != point_eight.rows.len() {
            warn!(
                zero = zero.rows.len(),
                point_eight = point_eight.rows.len(),
                "Traces differ in length; truncating to {}",
                n
            );
        }

        let rho = zero.summary_value("Air_density").unwrap_or(fallback_rho);
        let prop_inch = zero.rows[0].prop_inch;
        let tip_radius_m = if prop_inch > 0.0 {
            prop_inch * 25.4 / 2.0 / 1000.0
        } else {
            fallback_radius_m
        };

        let mut rows: Vec<CotRow> = zero.rows[..n]
            .iter()
            .zip(&point_eight.rows[..n])
            .map(|(z, e)| {
                let x_m = z.x_mm / 1000.0;
                let va0 = z.v_axial;
                let delta_va = (e.v_axial - va0).max(0.0);
                CotRow {
                    x_mm: z.x_mm,
                    va0,
                    va08: e.v_axial,
                    delta_va,
                    diff_mass_rate: PI * rho * va0 * x_m,
                    diff_thrust: PI * rho * va0 * (va0 + delta_va) * x_m,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.x_mm.total_cmp(&b.x_mm));

        let x_m: Vec<f64> = rows.iter().map(|r| r.x_mm / 1000.0).collect();
        let density: Vec<f64> = rows
            .iter()
            .map(|r| PI * rho * r.va0 * (r.va0 + r.delta_va))
            .collect();
        let x_last = x_m.last().copied().unwrap_or(0.0);
        let moment = thrust_moment(&x_m, &density, tip_radius_m.min(x_last));

        let mean_thrust = zero.rows[..n].iter().map(|r| r.thrust1_n).sum::<f64>() / n as f64;
        let radius_m = if mean_thrust == 0.0 {
            0.0
        } else {
            2.0 * moment / mean_thrust
        };
        let percent = if tip_radius_m == 0.0 {
            0.0
        } else {
            radius_m / tip_radius_m * 100.0
        };

        Ok(Self {
            rows,
            rho,
            tip_radius_m,
            mean_thrust,
            thrust_moment: moment,
            radius_m,
            percent,
        })
    }
}

/// `<stem>_cot.csv` next to the 0 R trace.
pub fn cot_path(zero_trace: &Path) -> PathBuf {
    let stem = zero_trace
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trace".to_string());
    zero_trace.with_file_name(format!("{}_cot.csv", stem))
}

pub fn write_cot(path: &Path, cot: &CenterOfThrust) -> AppResult<()> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)?;
    writer.write_record(COT_COLUMNS)?;
    for r in &cot.rows {
        writer.write_record([
            format!("{:.0}", r.x_mm),
            format!("{:.2}", r.va0),
            format!("{:.2}", r.va08),
            format!("{:.2}", r.delta_va),
            format!("{:.4}", r.diff_mass_rate),
            format!("{:.4}", r.diff_thrust),
        ])?;
    }
    writer.flush()?;

    let mut file: File = writer
        .into_inner()
        .map_err(|e| DaqError::Io(e.into_error()))?;
    file.write_all(b"\n")?;

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(file);
    writer.write_record(["Thrust_moment", format!("{:.4}", cot.thrust_moment).as_str(), "Nm"])?;
    writer.write_record(["Center_of_thrust_radius", format!("{:.4}", cot.radius_m).as_str(), "m"])?;
    writer.write_record(["Center_of_thrust", format!("{:.2}", cot.percent).as_str(), "%"])?;
    writer.write_record(["Air_density", format!("{:.3}", cot.rho).as_str(), "kg/m3"])?;
    writer.flush()?;
    Ok(())
}

/// Read both reduced traces, compute and write `<zero_stem>_cot.csv`.
pub fn center_of_thrust_files(
    zero: &Path,
    point_eight: &Path,
    fallback_rho: f64,
    fallback_radius_m: f64,
) -> AppResult<(CenterOfThrust, PathBuf)> {
    let zero_table = read_trace(zero)?;
    let eight_table = read_trace(point_eight)?;
    let cot = CenterOfThrust::compute(&zero_table, &eight_table, fallback_rho, fallback_radius_m)?;
    let out = cot_path(zero);
    write_cot(&out, &cot)?;
    info!(
        radius_m = cot.radius_m,
        percent = cot.percent,
        "Center of thrust written to '{}'",
        out.display()
    );
    Ok((cot, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::trace::{SummaryEntry, TraceRow};

    fn table(points: &[(f64, f64)], thrust: f64, rho: Option<f64>) -> TraceTable {
        TraceTable {
            rows: points
                .iter()
                .map(|&(x_mm, v_axial)| TraceRow {
                    samples: 1,
                    prop_inch: 10.0,
                    x_mm,
                    v_axial,
                    thrust1_n: thrust,
                    ..TraceRow::default()
                })
                .collect(),
            summary: rho
                .map(|value| {
                    vec![SummaryEntry {
                        name: "Air_density".to_string(),
                        value,
                        unit: "kg/m3".to_string(),
                    }]
                })
                .unwrap_or_default(),
            tandem: false,
        }
    }

    #[test]
    fn piecewise_integral_is_exact() {
        // c = 3 on [0, 1), c = 6 on [1, 2): 3·(1/3) + 6·(8 − 1)/3 = 15
        let m = thrust_moment(&[0.0, 1.0, 2.0], &[3.0, 6.0, 9.0], 10.0);
        assert!((m - 15.0).abs() < 1e-12);
        // upper bound clips the last segment
        let m = thrust_moment(&[0.0, 1.0, 2.0], &[3.0, 6.0, 9.0], 1.5);
        assert!((m - (1.0 + 6.0 * (3.375 - 1.0) / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn delta_va_is_clamped_and_rho_read_from_summary() {
        let zero = table(&[(0.0, 10.0), (3.0, 12.0), (6.0, 11.0)], 2.0, Some(1.2));
        let eight = table(&[(0.0, 11.0), (3.0, 10.0), (6.0, 11.5), (9.0, 1.0)], 2.0, None);
        let cot = CenterOfThrust::compute(&zero, &eight, 1.225, 0.1).unwrap();

        assert_eq!(cot.rows.len(), 3);
        assert_eq!(cot.rho, 1.2);
        assert!((cot.rows[0].delta_va - 1.0).abs() < 1e-12);
        assert_eq!(cot.rows[1].delta_va, 0.0);
        assert!((cot.tip_radius_m - 0.127).abs() < 1e-12);

        let expected_mass = PI * 1.2 * 12.0 * 0.003;
        assert!((cot.rows[1].diff_mass_rate - expected_mass).abs() < 1e-12);
        assert!((cot.radius_m - 2.0 * cot.thrust_moment / 2.0).abs() < 1e-12);
        assert!((cot.percent - cot.radius_m / 0.127 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_thrust_gives_zero_radius() {
        let zero = table(&[(0.0, 10.0), (3.0, 12.0)], 0.0, None);
        let cot = CenterOfThrust::compute(&zero, &zero, 1.225, 0.1).unwrap();
        assert_eq!(cot.radius_m, 0.0);
        assert_eq!(cot.percent, 0.0);
    }

    #[test]
    fn empty_trace_is_an_error() {
        let zero = table(&[], 1.0, None);
        let eight = table(&[(0.0, 1.0)], 1.0, None);
        assert!(CenterOfThrust::compute(&zero, &eight, 1.225, 0.1).is_err());
    }

    #[test]
    fn output_is_readable_as_a_trace() {
        let dir = tempfile::tempdir().unwrap();
        let zero = table(&[(0.0, 10.0), (3.0, 12.0)], 1.0, None);
        let cot = CenterOfThrust::compute(&zero, &zero, 1.225, 0.1).unwrap();
        let path = cot_path(&dir.path().join("run_mean.csv"));
        assert!(path.ends_with("run_mean_cot.csv"));

        write_cot(&path, &cot).unwrap();
        let table = read_trace(&path).unwrap();
        assert_eq!(table.rows.len(), 2);
        assert!(table.summary_value("Center_of_thrust").is_some());
    }
}
