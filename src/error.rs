//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the live
//! acquisition path and the offline reduction. It is built with `thiserror`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps `figment` errors raised while merging the TOML file and
//!   `PROPSTAND_` environment overrides.
//! - **`Configuration`**: Values that parse but make no physical sense, such as a
//!   zero steps-per-mm ratio. Raised by `Settings::validate`.
//! - **`Io`** and **`Csv`**: File-level failures while writing or re-reading a trace.
//! - **`SerialPortNotConnected`**, **`LinkClosed`**: Transport faults. The session
//!   treats them as "disconnected" and stops issuing commands.
//! - **`SessionClosed`**: The session actor's command channel is gone.
//! - **`SweepInProgress`**, **`NoWaypoints`**: A sweep request that cannot be honored.
//! - **`MotionFault`**, **`EmergencyStop`**: Physical-limit faults that end a sweep.
//! - **`Processing`**: Trace content the reduction cannot use at all (no header, no rows).
//!
//! Malformed wire lines and numeric degeneracies in the reduction never become a
//! `DaqError`; they are dropped or replaced by sentinel values where they occur.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Telemetry link closed")]
    LinkClosed,

    #[error("Session actor is no longer running")]
    SessionClosed,

    #[error("Trace error: {0}")]
    Trace(String),

    #[error("A sweep is already in progress")]
    SweepInProgress,

    #[error("Sweep requested with an empty trajectory")]
    NoWaypoints,

    #[error("Motion fault: {0}")]
    MotionFault(String),

    #[error("Emergency stop reported by the rig")]
    EmergencyStop,

    #[error("Data processing error: {0}")]
    Processing(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::MotionFault("over axis limit on waypoint 4".to_string());
        assert_eq!(err.to_string(), "Motion fault: over axis limit on waypoint 4");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "trace.csv");
        let err: DaqError = io.into();
        assert!(matches!(err, DaqError::Io(_)));
        assert!(err.to_string().starts_with("I/O error"));
    }
}
