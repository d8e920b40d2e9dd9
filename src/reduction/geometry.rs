//! Blade geometry table.
//!
//! One row per radial station: `station_mm chord_angle_deg chord_length_mm`,
//! space or comma separated. Stations are matched exactly on whole mm; a
//! station the table does not list reads as `(0.0, 0.0)`. A station listed
//! twice keeps its last row.

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BladeGeometryEntry {
    pub radial_station_mm: i64,
    pub chord_angle_deg: f64,
    pub chord_length_mm: f64,
}

/// Chord angle and length per whole-mm radial station.
#[derive(Debug, Clone, Default)]
pub struct BladeGeometry {
    entries: HashMap<i64, BladeGeometryEntry>,
}

impl BladeGeometry {
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let geometry = Self::parse(&std::fs::read_to_string(path)?);
        info!(
            stations = geometry.len(),
            "Loaded blade geometry from '{}'",
            path.display()
        );
        Ok(geometry)
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let values: Option<Vec<f64>> = line
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|t| !t.is_empty())
                .take(3)
                .map(|t| t.parse::<f64>().ok())
                .collect();
            let Some([station, angle, length]) = values
                .as_deref()
                .and_then(|v| <[f64; 3]>::try_from(v).ok())
            else {
                continue;
            };
            if station.fract() != 0.0 {
                debug!(station, "Skipping non-integer blade station");
                continue;
            }
            let station = station as i64;
            entries.insert(
                station,
                BladeGeometryEntry {
                    radial_station_mm: station,
                    chord_angle_deg: angle,
                    chord_length_mm: length,
                },
            );
        }
        Self { entries }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = BladeGeometryEntry>) -> Self {
        let mut map = HashMap::new();
        for e in entries {
            map.insert(e.radial_station_mm, e);
        }
        Self { entries: map }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(chord_angle_deg, chord_length_mm)` at `station_mm`, zeros on a miss.
    pub fn lookup(&self, station_mm: i64) -> (f64, f64) {
        self.entries
            .get(&station_mm)
            .map(|e| (e.chord_angle_deg, e.chord_length_mm))
            .unwrap_or((0.0, 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_station_lookup() {
        let geometry = BladeGeometry::parse("station angle length\n0 0 0\n3 24.5 18.2\n6,22.0,19.0\n7.5 1 1\n");
        assert_eq!(geometry.len(), 3);
        assert_eq!(geometry.lookup(3), (24.5, 18.2));
        assert_eq!(geometry.lookup(6), (22.0, 19.0));
        assert_eq!(geometry.lookup(9), (0.0, 0.0));
    }

    #[test]
    fn last_duplicate_wins() {
        let geometry = BladeGeometry::parse("3 10 20\n6 1 1\n3 11 21\n");
        assert_eq!(geometry.len(), 2);
        assert_eq!(geometry.lookup(3), (11.0, 21.0));

        let entry = |angle| BladeGeometryEntry {
            radial_station_mm: 9,
            chord_angle_deg: angle,
            chord_length_mm: 15.0,
        };
        let geometry = BladeGeometry::from_entries([entry(20.0), entry(22.5)]);
        assert_eq!(geometry.lookup(9), (22.5, 15.0));
    }

    #[test]
    fn short_rows_are_ignored() {
        let geometry = BladeGeometry::parse("3 10\n");
        assert!(geometry.is_empty());
    }
}
