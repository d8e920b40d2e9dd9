//! Serial transport for the rig microcontroller.
//!
//! Opens the port through `tokio-serial` and hands back a `TelemetryLink`
//! over the native async stream. Without the `instrument_serial` feature
//! opening fails with `DaqError::SerialFeatureDisabled` and only the simulated
//! rig can be driven.

use crate::adapters::TelemetryLink;
use crate::config::SerialConfig;
use crate::error::{AppResult, DaqError};
use tracing::info;

#[cfg(feature = "instrument_serial")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Serial adapter builder for the rig link
///
/// # Example
/// ```no_run
/// use propstand_daq::adapters::SerialAdapter;
///
/// # async fn demo() -> propstand_daq::error::AppResult<()> {
/// let mut link = SerialAdapter::new("/dev/ttyUSB0".to_string(), 115_200)
///     .with_line_terminator("\n")
///     .open()?;
/// link.send_line("home").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,
    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,
    /// Line terminator for commands
    line_terminator: String,
}

impl SerialAdapter {
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            line_terminator: "\n".to_string(),
        }
    }

    /// Build from the `[serial]` configuration section.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate)
            .with_line_terminator(config.line_terminator.clone())
    }

    /// Set the line terminator string for commands
    ///
    /// Default: "\n"
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Open the port, 8N1 without flow control.
    #[cfg(feature = "instrument_serial")]
    pub fn open(self) -> AppResult<TelemetryLink<SerialStream>> {
        if self.port_name.trim().is_empty() {
            return Err(DaqError::SerialPortNotConnected);
        }
        let stream = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        self.port_name, self.baud_rate, e
                    ),
                ))
            })?;

        info!(
            "Serial port '{}' opened at {} baud",
            self.port_name, self.baud_rate
        );
        Ok(TelemetryLink::new(stream).with_line_terminator(self.line_terminator))
    }

    /// Serial support was compiled out.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(self) -> AppResult<TelemetryLink<tokio::io::DuplexStream>> {
        info!(
            "Refusing to open '{}': serial support disabled",
            self.port_name
        );
        Err(DaqError::SerialFeatureDisabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_reads_config() {
        let config = SerialConfig {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 57_600,
            line_terminator: "\r\n".to_string(),
        };
        let adapter = SerialAdapter::from_config(&config);
        assert_eq!(adapter.port_name(), "/dev/ttyACM0");
        assert_eq!(adapter.baud_rate, 57_600);
        assert_eq!(adapter.line_terminator, "\r\n");
    }

    #[cfg(feature = "instrument_serial")]
    #[tokio::test]
    async fn empty_port_name_is_not_connected() {
        let result = SerialAdapter::new(String::new(), 115_200).open();
        assert!(matches!(result, Err(DaqError::SerialPortNotConnected)));
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[test]
    fn open_without_feature_reports_it() {
        let result = SerialAdapter::new("/dev/ttyUSB0".to_string(), 115_200).open();
        assert!(matches!(result, Err(DaqError::SerialFeatureDisabled)));
    }
}
