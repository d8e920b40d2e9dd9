//! Momentum-theory summary of one sweep.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Sweep-level inputs accumulated over the radial bands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumInputs {
    pub radius_m: f64,
    pub band_width_m: f64,
    /// Σ x_m · v_axial over all bands
    pub axial_moment: f64,
    pub mean_thrust: f64,
    pub mean_torque: f64,
    pub omega: f64,
    pub rho: f64,
}

/// Scalar performance metrics. Degenerate divisions read 0, except
/// efficiency which reads -1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub omega: f64,
    pub induced_velocity: f64,
    pub thrust: f64,
    pub torque: f64,
    pub induced_power: f64,
    pub power: f64,
    pub efficiency_pct: f64,
    pub airspeed_ratio: f64,
    pub mass_flow: f64,
    pub v_max_mean: f64,
    pub ct: f64,
    pub cp: f64,
}

/// Second rotor metrics on tandem rigs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotorSummary {
    pub omega: f64,
    pub thrust: f64,
    pub torque: f64,
    pub power: f64,
    pub ct: f64,
    pub cp: f64,
}

pub const EFFICIENCY_SENTINEL: f64 = -1.0;

fn ratio(num: f64, den: f64, sentinel: f64) -> f64 {
    if den == 0.0 {
        return sentinel;
    }
    let value = num / den;
    if value.is_finite() {
        value
    } else {
        sentinel
    }
}

/// `Ct = T/(ρ·ω²·D⁴)` and `Cp = M/(ρ·ω²·D⁵)` with `D = 2r`.
pub fn coefficients(thrust: f64, torque: f64, rho: f64, omega: f64, radius_m: f64) -> (f64, f64) {
    let d = 2.0 * radius_m;
    let base = rho * omega * omega;
    (
        ratio(thrust, base * d.powi(4), 0.0),
        ratio(torque, base * d.powi(5), 0.0),
    )
}

impl PerformanceSummary {
    pub fn compute(inputs: &MomentumInputs) -> Self {
        let MomentumInputs {
            radius_m,
            band_width_m,
            axial_moment,
            mean_thrust: t,
            mean_torque: m,
            omega,
            rho,
        } = *inputs;

        let disk = PI * radius_m * radius_m;
        let vi = ratio(2.0 * band_width_m * axial_moment, radius_m * radius_m, 0.0);
        let pi = vi * t;
        let p = m * omega;
        let mass_flow = rho * disk * vi;
        let (ct, cp) = coefficients(t, m, rho, omega, radius_m);

        Self {
            omega,
            induced_velocity: vi,
            thrust: t,
            torque: m,
            induced_power: pi,
            power: p,
            efficiency_pct: ratio(100.0 * pi, p, EFFICIENCY_SENTINEL),
            airspeed_ratio: ratio(t, rho * disk * vi * vi, 0.0),
            mass_flow,
            v_max_mean: ratio(t, mass_flow, 0.0),
            ct,
            cp,
        }
    }
}

impl RotorSummary {
    pub fn compute(thrust: f64, torque: f64, omega: f64, rho: f64, radius_m: f64) -> Self {
        let (ct, cp) = coefficients(thrust, torque, rho, omega, radius_m);
        Self {
            omega,
            thrust,
            torque,
            power: torque * omega,
            ct,
            cp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> MomentumInputs {
        MomentumInputs {
            radius_m: 0.127,
            band_width_m: 0.003,
            axial_moment: 0.5,
            mean_thrust: 4.0,
            mean_torque: 0.05,
            omega: 600.0,
            rho: 1.225,
        }
    }

    #[test]
    fn summary_formulas() {
        let s = PerformanceSummary::compute(&inputs());
        let vi = 2.0 * 0.003 * 0.5 / (0.127 * 0.127);
        assert!((s.induced_velocity - vi).abs() < 1e-12);
        assert!((s.induced_power - vi * 4.0).abs() < 1e-12);
        assert!((s.power - 30.0).abs() < 1e-12);
        assert!((s.efficiency_pct - 100.0 * vi * 4.0 / 30.0).abs() < 1e-9);
        let mass = 1.225 * PI * 0.127 * 0.127 * vi;
        assert!((s.mass_flow - mass).abs() < 1e-12);
        assert!((s.v_max_mean - 4.0 / mass).abs() < 1e-9);
        let ct = 4.0 / (1.225 * 600.0 * 600.0 * 0.254f64.powi(4));
        assert!((s.ct - ct).abs() < 1e-12);
    }

    #[test]
    fn zero_torque_gives_efficiency_sentinel() {
        let s = PerformanceSummary::compute(&MomentumInputs {
            mean_torque: 0.0,
            ..inputs()
        });
        assert_eq!(s.power, 0.0);
        assert_eq!(s.efficiency_pct, EFFICIENCY_SENTINEL);
        assert_eq!(s.cp, 0.0);
    }

    #[test]
    fn zero_omega_and_flow_degrade_to_zero() {
        let s = PerformanceSummary::compute(&MomentumInputs {
            omega: 0.0,
            axial_moment: 0.0,
            ..inputs()
        });
        assert_eq!(s.induced_velocity, 0.0);
        assert_eq!(s.airspeed_ratio, 0.0);
        assert_eq!(s.v_max_mean, 0.0);
        assert_eq!(s.ct, 0.0);
        assert_eq!(s.cp, 0.0);
        assert_eq!(s.efficiency_pct, EFFICIENCY_SENTINEL);
    }

    #[test]
    fn second_rotor_summary() {
        let r = RotorSummary::compute(3.0, 0.04, 500.0, 1.2, 0.127);
        assert!((r.power - 20.0).abs() < 1e-12);
        assert!(r.ct > 0.0 && r.cp > 0.0);
    }
}
