//! Blade-element kinematics for one radial band.
//!
//! Every division or inverse trig call that can degenerate falls back to a
//! fixed value (0.0) instead of producing NaN or an error, so a single bad
//! band never spoils the rest of the reduction.

use serde::{Deserialize, Serialize};

/// Effective chord after the induced radial-flow correction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChordEffective {
    pub angle_deg: f64,
    pub length_mm: f64,
}

/// Velocity triangle and section coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionKinematics {
    pub total_speed: f64,
    pub helix_angle_deg: f64,
    pub alpha_deg: f64,
    pub v_lift: f64,
    pub v_drag: f64,
    pub cl: f64,
    pub cd: f64,
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Relative tangential speed at the section, `ω·x − v_tan`.
pub fn relative_tangential(omega: f64, x_m: f64, v_tan: f64) -> f64 {
    omega * x_m - v_tan
}

/// `chordAngle_eff = atan(tan(raw)·cos(atan(v_rad/(ω·x − v_tan))))` and
/// `chordLength_eff = raw_length / cos(atan(...))`. Both are zero when the
/// relative tangential speed is exactly zero.
pub fn chord_effective(
    omega: f64,
    x_m: f64,
    v_tan: f64,
    v_rad: f64,
    chord_angle_deg: f64,
    chord_length_mm: f64,
) -> ChordEffective {
    let zero = ChordEffective {
        angle_deg: 0.0,
        length_mm: 0.0,
    };
    let denom = relative_tangential(omega, x_m, v_tan);
    if denom == 0.0 {
        return zero;
    }
    let factor = (v_rad / denom).atan().cos();
    let angle = (chord_angle_deg.to_radians().tan() * factor).atan().to_degrees();
    let length = chord_length_mm / factor;
    if !angle.is_finite() || !length.is_finite() {
        return zero;
    }
    ChordEffective {
        angle_deg: angle,
        length_mm: length,
    }
}

pub fn section_kinematics(
    omega: f64,
    x_m: f64,
    v_tan: f64,
    v_rad: f64,
    v_axial: f64,
    chord_angle_eff_deg: f64,
) -> SectionKinematics {
    let rel = relative_tangential(omega, x_m, v_tan);
    let total = (rel * rel + v_axial * v_axial + v_rad * v_rad).sqrt();

    let helix = if total == 0.0 {
        0.0
    } else {
        finite_or((v_axial / total).asin().to_degrees(), 0.0)
    };
    let h = helix.to_radians();
    let v_lift = v_axial * h.cos() + v_tan * h.sin();
    let v_drag = v_tan * h.cos() - v_axial * h.sin();

    let (cl, cd) = if total == 0.0 {
        (0.0, 0.0)
    } else {
        (
            finite_or(2.0 * v_lift / total, 0.0),
            finite_or(2.0 * v_drag / total, 0.0),
        )
    };

    SectionKinematics {
        total_speed: total,
        helix_angle_deg: helix,
        alpha_deg: chord_angle_eff_deg - helix,
        v_lift,
        v_drag,
        cl,
        cd,
    }
}

/// `Re = (chord_eff_m · V_total) / (ν · 1e-5)`, zero when ν is zero.
pub fn reynolds(chord_length_eff_mm: f64, total_speed: f64, kin_visc_e5: f64) -> f64 {
    let nu = kin_visc_e5 * 1e-5;
    if nu == 0.0 {
        return 0.0;
    }
    finite_or(chord_length_eff_mm / 1000.0 * total_speed / nu, 0.0)
}
