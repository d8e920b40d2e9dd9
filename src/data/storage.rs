//! Crash-safe trace writer.
//!
//! Rows are appended to a CSV file and flushed one at a time so that a
//! power loss or a fault mid-sweep leaves every completed row on disk. A new
//! file gets a header; an existing one gets a blank separator line before the
//! next sweep's rows so numeric readers can tell sweeps apart. When the
//! appended sweep has a different rotor layout than the file's first header,
//! the new layout's header follows the separator.
use crate::data::trace::TraceRow;
use crate::error::{AppResult, DaqError};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Timestamped file name for a new trace, e.g. `trace_20250101_120000.csv`.
pub fn default_trace_name() -> String {
    format!("trace_{}.csv", chrono::Local::now().format("%Y%m%d_%H%M%S"))
}

/// Append-only CSV writer for one sweep's trace rows.
pub struct TraceWriter {
    path: PathBuf,
    tandem: bool,
    writer: Option<csv::Writer<File>>,
    rows_written: usize,
}

impl TraceWriter {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open<P: AsRef<Path>>(path: P, tandem: bool) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let existing = std::fs::metadata(&path)
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        let needs_header = !existing || existing_layout(&path)? != Some(tandem);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        if existing {
            // The csv writer cannot emit a truly empty record.
            file.write_all(b"\n")?;
            if needs_header {
                warn!(
                    tandem,
                    "Appending to '{}' with a different rotor layout",
                    path.display()
                );
            }
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(TraceRow::header(tandem))?;
        }
        writer.flush()?;

        info!(
            "Trace '{}' opened ({})",
            path.display(),
            if existing { "appending" } else { "new" }
        );
        Ok(Self {
            path,
            tandem,
            writer: Some(writer),
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Append one row and flush it to disk.
    pub fn append(&mut self, row: &TraceRow) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Trace(format!("'{}' is closed", self.path.display())))?;
        writer.write_record(row.to_record(self.tandem))?;
        writer.flush()?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flush and release the file. Closing twice is a no-op.
    pub fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                "Trace '{}' closed after {} rows",
                self.path.display(),
                self.rows_written
            );
        }
        Ok(())
    }
}

/// Rotor layout of the first header in an existing trace: `Some(true)` for
/// tandem, `None` when the file has no header line.
fn existing_layout(path: &Path) -> AppResult<Option<bool>> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with("samples") {
            return Ok(None);
        }
        return Ok(Some(line.contains("thrust2_N")));
    }
    Ok(None)
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::trace::read_trace;
    use tempfile::tempdir;

    fn row(x_mm: f64) -> TraceRow {
        TraceRow {
            samples: 1,
            x_mm,
            thrust1_n: 1.25,
            ..TraceRow::default()
        }
    }

    #[test]
    fn new_file_gets_header_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/run.csv");

        let mut writer = TraceWriter::open(&path, false).unwrap();
        writer.append(&row(0.0)).unwrap();
        writer.append(&row(3.0)).unwrap();
        writer.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("samples,prop_inch"));
    }

    #[test]
    fn rows_are_on_disk_before_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");

        let mut writer = TraceWriter::open(&path, false).unwrap();
        writer.append(&row(0.0)).unwrap();

        let table = read_trace(&path).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert!(writer.is_open());
    }

    #[test]
    fn appending_adds_blank_separator_not_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");

        let mut first = TraceWriter::open(&path, true).unwrap();
        first.append(&row(0.0)).unwrap();
        first.close().unwrap();

        let mut second = TraceWriter::open(&path, true).unwrap();
        second.append(&row(3.0)).unwrap();
        second.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("samples,").count(), 1);
        assert!(text.contains("\n\n"));

        let table = read_trace(&path).unwrap();
        assert!(table.tandem);
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn tandem_sweep_appended_to_single_rotor_trace_gets_its_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");

        let mut first = TraceWriter::open(&path, false).unwrap();
        first.append(&row(0.0)).unwrap();
        first.close().unwrap();

        let mut second = TraceWriter::open(&path, true).unwrap();
        second
            .append(&TraceRow {
                thrust2_n: 0.75,
                ..row(3.0)
            })
            .unwrap();
        second.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("samples,").count(), 2);

        let table = read_trace(&path).unwrap();
        assert!(table.tandem);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].thrust2_n, 0.0);
        assert_eq!(table.rows[1].thrust2_n, 0.75);
    }

    #[test]
    fn append_after_close_is_refused() {
        let dir = tempdir().unwrap();
        let mut writer = TraceWriter::open(dir.path().join("run.csv"), false).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.append(&row(0.0)), Err(DaqError::Trace(_))));
    }
}
