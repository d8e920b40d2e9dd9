//! Trace rows and the trace file reader.
//!
//! A trace is a delimited text file: one header row, then one row per flushed
//! bin. Sweeps appended to an existing trace are separated by a blank line.
//! Reduced traces (`*_mean.csv`) add more columns and a block of named
//! summary rows (`Omega,123.4,rad/s`) after a blank line.
//!
//! The reader is header-driven: columns are located by name, unknown columns
//! are ignored and missing ones read as zero. Every header row re-maps the
//! columns for the rows below it, so a tandem sweep appended to a
//! single-rotor trace keeps its rotor-2 columns. Header names written by older
//! acquisition software (`X_position(mm)`, `Torque1(Nm)`, ...) are accepted as
//! aliases. Fields may be separated by commas or whitespace.

use crate::error::{AppResult, DaqError};
use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Columns of a single-rotor acquisition trace, in file order.
pub const TRACE_COLUMNS: [&str; 14] = [
    "samples",
    "prop_inch",
    "dr_ratio",
    "x_mm",
    "y_mm",
    "torque1_Nm",
    "thrust1_N",
    "omega1_rad_s",
    "airspeed_mps",
    "aoa_deg",
    "aoss_deg",
    "v_tan_mps",
    "v_rad_mps",
    "v_axial_mps",
];

/// Extra columns appended on tandem rigs.
pub const TANDEM_COLUMNS: [&str; 3] = ["torque2_Nm", "thrust2_N", "omega2_rad_s"];

/// One reduced record of the acquisition trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRow {
    /// Frames averaged into this row
    pub samples: usize,
    pub prop_inch: f64,
    pub dr_ratio: f64,
    /// Radial distance from the hub, whole mm
    pub x_mm: f64,
    /// Axial offset from the sweep's first Y position
    pub y_mm: f64,
    pub torque1_nm: f64,
    pub thrust1_n: f64,
    pub omega1: f64,
    pub airspeed: f64,
    /// Signed angle of attack
    pub aoa_deg: f64,
    pub aoss_deg: f64,
    pub v_tan: f64,
    pub v_rad: f64,
    pub v_axial: f64,
    pub torque2_nm: f64,
    pub thrust2_n: f64,
    pub omega2: f64,
}

fn num(v: f64, decimals: usize) -> String {
    format!("{:.*}", decimals, v)
}

impl TraceRow {
    pub fn header(tandem: bool) -> Vec<&'static str> {
        let mut cols = TRACE_COLUMNS.to_vec();
        if tandem {
            cols.extend_from_slice(&TANDEM_COLUMNS);
        }
        cols
    }

    /// Field values in `header(tandem)` order.
    pub fn to_record(&self, tandem: bool) -> Vec<String> {
        let mut rec = vec![
            self.samples.to_string(),
            num(self.prop_inch, 2),
            num(self.dr_ratio, 3),
            num(self.x_mm, 0),
            num(self.y_mm, 0),
            num(self.torque1_nm, 5),
            num(self.thrust1_n, 4),
            num(self.omega1, 2),
            num(self.airspeed, 3),
            num(self.aoa_deg, 3),
            num(self.aoss_deg, 3),
            num(self.v_tan, 3),
            num(self.v_rad, 3),
            num(self.v_axial, 3),
        ];
        if tandem {
            rec.push(num(self.torque2_nm, 5));
            rec.push(num(self.thrust2_n, 4));
            rec.push(num(self.omega2, 2));
        }
        rec
    }

    fn set(&mut self, column: Column, value: f64) {
        match column {
            Column::Samples => self.samples = value.max(0.0).round() as usize,
            Column::PropInch => self.prop_inch = value,
            Column::DrRatio => self.dr_ratio = value,
            Column::X => self.x_mm = value,
            Column::Y => self.y_mm = value,
            Column::Torque1 => self.torque1_nm = value,
            Column::Thrust1 => self.thrust1_n = value,
            Column::Omega1 => self.omega1 = value,
            Column::Airspeed => self.airspeed = value,
            Column::Aoa => self.aoa_deg = value,
            Column::Aoss => self.aoss_deg = value,
            Column::VTan => self.v_tan = value,
            Column::VRad => self.v_rad = value,
            Column::VAxial => self.v_axial = value,
            Column::Torque2 => self.torque2_nm = value,
            Column::Thrust2 => self.thrust2_n = value,
            Column::Omega2 => self.omega2 = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    Samples,
    PropInch,
    DrRatio,
    X,
    Y,
    Torque1,
    Thrust1,
    Omega1,
    Airspeed,
    Aoa,
    Aoss,
    VTan,
    VRad,
    VAxial,
    Torque2,
    Thrust2,
    Omega2,
}

fn column_for(name: &str) -> Option<Column> {
    let column = match name.trim().to_ascii_lowercase().as_str() {
        "samples" => Column::Samples,
        "prop_inch" | "prop_diam(inch)" => Column::PropInch,
        "dr_ratio" => Column::DrRatio,
        "x_mm" | "x_position(mm)" => Column::X,
        "y_mm" | "y_position(mm)" => Column::Y,
        "torque1_nm" | "torque(nm)" | "torque1(nm)" => Column::Torque1,
        "thrust1_n" | "thrust(n)" | "thrust1(n)" => Column::Thrust1,
        "omega1_rad_s" | "omega(rad/s)" | "omega1(rad/s)" => Column::Omega1,
        "airspeed_mps" | "airspeed(m/s)" => Column::Airspeed,
        "aoa_deg" | "aoa(deg)" => Column::Aoa,
        "aoss_deg" | "aoss(deg)" => Column::Aoss,
        "v_tan_mps" | "v_tan(m/s)" => Column::VTan,
        "v_rad_mps" | "v_rad(m/s)" => Column::VRad,
        "v_axial_mps" | "v_axial(m/s)" => Column::VAxial,
        "torque2_nm" | "torque2(nm)" => Column::Torque2,
        "thrust2_n" | "thrust2(n)" => Column::Thrust2,
        "omega2_rad_s" | "omega2(rad/s)" => Column::Omega2,
        _ => return None,
    };
    Some(column)
}

/// Named scalar row from a reduced trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// Parsed contents of a trace file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceTable {
    pub rows: Vec<TraceRow>,
    pub summary: Vec<SummaryEntry>,
    /// Rotor-2 columns were present
    pub tandem: bool,
}

impl TraceTable {
    pub fn summary_value(&self, name: &str) -> Option<f64> {
        self.summary
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value)
    }
}

/// Split a record into fields, re-splitting whitespace separated lines that
/// the comma reader saw as a single field.
fn fields(record: &csv::StringRecord) -> Vec<String> {
    if record.len() == 1 {
        record
            .get(0)
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    } else {
        record.iter().map(|f| f.trim().to_string()).collect()
    }
}

pub fn read_trace<P: AsRef<Path>>(path: P) -> AppResult<TraceTable> {
    let path = path.as_ref();
    let reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)?;
    let table = read_records(reader)?;
    debug!(
        rows = table.rows.len(),
        summary = table.summary.len(),
        "Read trace '{}'",
        path.display()
    );
    Ok(table)
}

/// Parse trace text already in memory.
pub fn parse_trace(text: &str) -> AppResult<TraceTable> {
    let reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());
    read_records(reader)
}

fn read_records<R: std::io::Read>(mut reader: csv::Reader<R>) -> AppResult<TraceTable> {
    let mut columns: Option<Vec<Option<Column>>> = None;
    let mut table = TraceTable::default();

    for (lineno, result) in reader.records().enumerate() {
        let record = result?;
        let fields = fields(&record);
        let Some(first) = fields.first() else {
            continue;
        };
        if first.is_empty() {
            continue;
        }

        if first.parse::<f64>().is_err() {
            let mapped: Vec<Option<Column>> = fields.iter().map(|f| column_for(f)).collect();
            let known = mapped.iter().filter(|c| c.is_some()).count();
            if known >= 2 {
                if columns.as_ref().is_some_and(|c| *c != mapped) {
                    debug!(line = lineno + 1, "Trace header changes layout");
                }
                table.tandem |= mapped.contains(&Some(Column::Thrust2));
                columns = Some(mapped);
                continue;
            }
            if let Some(value) = fields.get(1).and_then(|v| v.parse::<f64>().ok()) {
                table.summary.push(SummaryEntry {
                    name: first.clone(),
                    value,
                    unit: fields.get(2).cloned().unwrap_or_default(),
                });
            } else {
                debug!(line = lineno + 1, "Skipping non-numeric trace line");
            }
            continue;
        }

        let Some(columns) = columns.as_ref() else {
            return Err(DaqError::Processing(
                "trace has data before any header row".to_string(),
            ));
        };
        let mut row = TraceRow::default();
        let mut ok = true;
        for (column, text) in columns.iter().zip(fields.iter()) {
            if let Some(column) = column {
                match text.parse::<f64>() {
                    Ok(v) => row.set(*column, v),
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            table.rows.push(row);
        } else {
            debug!(line = lineno + 1, "Skipping trace row with non-numeric field");
        }
    }

    if columns.is_none() {
        return Err(DaqError::Processing("trace has no header row".to_string()));
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> TraceRow {
        TraceRow {
            samples: 4,
            prop_inch: 10.0,
            x_mm: 6.0,
            y_mm: 0.0,
            torque1_nm: 0.02,
            thrust1_n: 1.5,
            omega1: 628.32,
            airspeed: 12.0,
            aoa_deg: 10.0,
            aoss_deg: 2.0,
            v_tan: 2.084,
            v_rad: 0.412,
            v_axial: 11.81,
            ..TraceRow::default()
        }
    }

    #[test]
    fn record_matches_header_width() {
        let row = sample_row();
        assert_eq!(row.to_record(false).len(), TraceRow::header(false).len());
        assert_eq!(row.to_record(true).len(), TraceRow::header(true).len());
    }

    #[test]
    fn reads_back_written_values() {
        let row = sample_row();
        let text = format!(
            "{}\n{}\n",
            TraceRow::header(false).join(","),
            row.to_record(false).join(",")
        );
        let table = parse_trace(&text).unwrap();
        assert_eq!(table.rows, vec![row]);
        assert!(!table.tandem);
    }

    #[test]
    fn tolerates_blank_separators_and_summary_rows() {
        let text = "x_mm,y_mm,thrust1_N\n0,0,1.0\n\n3,0,1.2\n\nOmega,628.3,rad/s\nCt,0.1000000,\n";
        let table = parse_trace(text).unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1].x_mm, 3.0);
        assert_eq!(table.summary_value("omega"), Some(628.3));
        assert_eq!(table.summary_value("Ct"), Some(0.1));
    }

    #[test]
    fn accepts_legacy_space_delimited_headers() {
        let text = "Prop_diam(inch) X_position(mm) Y_position(mm) Torque1(Nm) Thrust1(N) Omega1(rad/s) \
                    Airspeed(m/s) AoA(deg) AoSS(deg) V_tan(m/s) V_rad(m/s) V_axial(m/s) \
                    Torque2(Nm) Thrust2(N) Omega2(rad/s)\n\
                    10 3 0 0.02 1.5 600 12 5 1 1 0.2 11.9 0.03 1.4 610\n";
        let table = parse_trace(text).unwrap();
        assert!(table.tandem);
        let row = &table.rows[0];
        assert_eq!(row.x_mm, 3.0);
        assert_eq!(row.v_axial, 11.9);
        assert_eq!(row.thrust2_n, 1.4);
    }

    #[test]
    fn later_header_remaps_the_block_below_it() {
        let single = sample_row();
        let tandem = TraceRow {
            x_mm: 9.0,
            torque2_nm: 0.03,
            thrust2_n: 1.4,
            omega2: 610.0,
            ..sample_row()
        };
        let text = format!(
            "{}\n{}\n\n{}\n{}\n",
            TraceRow::header(false).join(","),
            single.to_record(false).join(","),
            TraceRow::header(true).join(","),
            tandem.to_record(true).join(","),
        );
        let table = parse_trace(&text).unwrap();
        assert!(table.tandem);
        assert_eq!(table.rows, vec![single, tandem]);
    }

    #[test]
    #[tracing_test::traced_test]
    fn skipped_lines_are_logged() {
        let text = "x_mm,y_mm,thrust1_N\n0,0,1.0\n3,0,n/a\nnotes,see logbook\n";
        let table = parse_trace(text).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert!(table.summary.is_empty());
        assert!(logs_contain("Skipping trace row with non-numeric field"));
        assert!(logs_contain("Skipping non-numeric trace line"));
    }

    #[test]
    fn missing_header_is_an_error() {
        assert!(matches!(
            parse_trace("1,2,3\n"),
            Err(DaqError::Processing(_))
        ));
        assert!(matches!(parse_trace(""), Err(DaqError::Processing(_))));
    }
}
