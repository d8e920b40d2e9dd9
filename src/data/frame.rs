//! Telemetry frames streamed by the rig.
//!
//! Field order on the wire is fixed:
//!
//! | idx | field | unit |
//! |-----|-------|------|
//! | 0 | x position | steps |
//! | 1 | y position | steps |
//! | 2 | thrust, rotor 1 | mN |
//! | 3 | torque, rotor 1 | N·mm |
//! | 4 | speed, rotor 1 | RPM |
//! | 5 | airspeed | m/s |
//! | 6 | AoA vane, raw | deg |
//! | 7 | AoA servo, absolute | deg |
//! | 8 | AoSS vane, raw | deg |
//! | 9 | AoSS, bias corrected | deg |
//! | 10 | thrust, rotor 2 | mN |
//! | 11 | torque, rotor 2 | N·mm |
//! | 12 | speed, rotor 2 | RPM |
//!
//! Single-rotor rigs use the first ten fields, tandem rigs all thirteen.

use serde::{Deserialize, Serialize};

pub const SINGLE_ROTOR_ARITY: usize = 10;
pub const TANDEM_ARITY: usize = 13;

/// One decoded measurement record, always exactly `arity` values long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    values: Vec<f64>,
}

impl TelemetryFrame {
    /// Pad with zeros or truncate to `arity`. Never rejects.
    pub fn normalized(mut values: Vec<f64>, arity: usize) -> Self {
        values.resize(arity, 0.0);
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn arity(&self) -> usize {
        self.values.len()
    }

    fn field(&self, idx: usize) -> f64 {
        self.values.get(idx).copied().unwrap_or(0.0)
    }

    pub fn x_steps(&self) -> f64 {
        self.field(0)
    }

    pub fn y_steps(&self) -> f64 {
        self.field(1)
    }

    pub fn thrust1_mn(&self) -> f64 {
        self.field(2)
    }

    pub fn torque1_nmm(&self) -> f64 {
        self.field(3)
    }

    pub fn rpm1(&self) -> f64 {
        self.field(4)
    }

    pub fn airspeed(&self) -> f64 {
        self.field(5)
    }

    pub fn aoa_raw(&self) -> f64 {
        self.field(6)
    }

    pub fn aoa_abs(&self) -> f64 {
        self.field(7)
    }

    pub fn aoss_abs(&self) -> f64 {
        self.field(9)
    }

    pub fn thrust2_mn(&self) -> f64 {
        self.field(10)
    }

    pub fn torque2_nmm(&self) -> f64 {
        self.field(11)
    }

    pub fn rpm2(&self) -> f64 {
        self.field(12)
    }

    /// Integer encoder position, as the rig reports it.
    pub fn position_steps(&self) -> (i64, i64) {
        (self.x_steps().round() as i64, self.y_steps().round() as i64)
    }

    /// Element-wise mean. `None` for an empty slice.
    pub fn mean(frames: &[TelemetryFrame]) -> Option<TelemetryFrame> {
        let first = frames.first()?;
        let mut acc = vec![0.0; first.arity()];
        for frame in frames {
            for (sum, v) in acc.iter_mut().zip(frame.values.iter()) {
                *sum += v;
            }
        }
        let n = frames.len() as f64;
        acc.iter_mut().for_each(|v| *v /= n);
        Some(TelemetryFrame { values: acc })
    }
}
