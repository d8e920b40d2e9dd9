//! Waypoint lists for a sweep.
//!
//! A trajectory is an ordered `Vec<Waypoint>` owned by whoever starts the
//! sweep. Waypoints come either from a trajectory file (one `x y` pair of
//! encoder steps per line) or from a generated radial sweep that walks the
//! probe from the hub out past the blade tip.

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Absolute encoder-step target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waypoint {
    pub x_steps: i64,
    pub y_steps: i64,
}

impl Waypoint {
    pub fn new(x_steps: i64, y_steps: i64) -> Self {
        Self { x_steps, y_steps }
    }

    /// Both axes within `tolerance` steps of this target.
    pub fn reached_by(&self, x_steps: i64, y_steps: i64, tolerance: i64) -> bool {
        (x_steps - self.x_steps).abs() <= tolerance && (y_steps - self.y_steps).abs() <= tolerance
    }
}

/// Parse a trajectory file. Blank lines, `#` comments and non-numeric header
/// lines are skipped; values may be separated by spaces, tabs or commas.
pub fn load_trajectory<P: AsRef<Path>>(path: P) -> AppResult<Vec<Waypoint>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let waypoints = parse_trajectory(&text)?;
    info!(
        "Loaded {} waypoints from '{}'",
        waypoints.len(),
        path.display()
    );
    Ok(waypoints)
}

pub fn parse_trajectory(text: &str) -> AppResult<Vec<Waypoint>> {
    let mut waypoints = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();

        let Some(Ok(x)) = tokens.first().map(|t| t.parse::<f64>()) else {
            debug!(line = lineno + 1, "Skipping non-numeric trajectory line");
            continue;
        };
        let y = tokens
            .get(1)
            .and_then(|t| t.parse::<f64>().ok())
            .ok_or_else(|| {
                DaqError::Processing(format!(
                    "trajectory line {}: expected 'x y' in steps, got {:?}",
                    lineno + 1,
                    line
                ))
            })?;
        waypoints.push(Waypoint::new(x.round() as i64, y.round() as i64));
    }
    Ok(waypoints)
}

/// Radial sweep from the hub toward home, one waypoint per bin width, ending
/// past the tip by the configured safety margin.
pub fn radial_sweep(settings: &Settings, y_steps: i64) -> Vec<Waypoint> {
    let center = settings.rig.x_center_steps();
    let spmm = settings.rig.steps_per_mm;
    let dx = settings.probe.x_delta_mm;
    let reach_mm =
        settings.propeller.radius_mm() * (1.0 + settings.propeller.safety_over_prop_pct / 100.0);

    let count = (reach_mm / dx).floor() as usize;
    (0..=count)
        .map(|i| {
            let offset = (i as f64 * dx * spmm).round() as i64;
            Waypoint::new(center - offset, y_steps)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_space_and_comma_separated_pairs() {
        let text = "x y\n# comment\n8099 0\n\n8024,  10\n7949\t20\n";
        let points = parse_trajectory(text).unwrap();
        assert_eq!(
            points,
            vec![
                Waypoint::new(8099, 0),
                Waypoint::new(8024, 10),
                Waypoint::new(7949, 20)
            ]
        );
    }

    #[test]
    fn rejects_line_missing_y() {
        let err = parse_trajectory("8099\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "100 5\n200 5").unwrap();
        let points = load_trajectory(file.path()).unwrap();
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn radial_sweep_walks_toward_home() {
        let mut settings = Settings::default();
        settings.rig.steps_per_mm = 10.0;
        settings.rig.x_center_mm = 300.0;
        settings.propeller.diameter_inch = 1.0; // 12.7 mm radius
        settings.propeller.safety_over_prop_pct = 0.0;

        let points = radial_sweep(&settings, 40);
        let xs: Vec<i64> = points.iter().map(|p| p.x_steps).collect();
        assert_eq!(xs, vec![3000, 2970, 2940, 2910, 2880]);
        assert!(points.iter().all(|p| p.y_steps == 40));
    }

    #[test]
    fn arrival_tolerance_is_inclusive() {
        let target = Waypoint::new(100, 50);
        assert!(target.reached_by(102, 48, 2));
        assert!(!target.reached_by(103, 50, 2));
    }
}
