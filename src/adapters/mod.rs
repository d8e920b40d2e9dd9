//! Telemetry link to the rig microcontroller.
//!
//! `TelemetryLink` wraps any bidirectional async byte stream (a serial port,
//! or an in-memory duplex pipe to the simulated rig) and exposes it as a line
//! transport. A closed or failing transport flips the link to disconnected:
//! reads yield no further lines and sends are refused, but nothing panics.

pub mod line_framer;
pub mod serial_adapter;

pub use line_framer::LineFramer;
pub use serial_adapter::SerialAdapter;

use crate::error::{AppResult, DaqError};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Line-oriented view of a byte stream.
pub struct TelemetryLink<T> {
    stream: T,
    framer: LineFramer,
    line_terminator: String,
    connected: bool,
}

impl<T> TelemetryLink<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a connected stream. Outbound lines are terminated with `\n`.
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            framer: LineFramer::new(),
            line_terminator: "\n".to_string(),
            connected: true,
        }
    }

    /// Set the terminator appended to outbound lines
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// False once the peer closed the stream or a read or write failed.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Return a completed line if one is available after at most one
    /// non-blocking read.
    pub fn poll(&mut self) -> Option<String> {
        if let Some(line) = self.framer.next_line() {
            return Some(line);
        }
        if !self.connected {
            return None;
        }
        let read = self.stream.read_buf(self.framer.buffer_mut()).now_or_never();
        match read {
            Some(result) => self.on_read(result),
            None => None,
        }
    }

    /// Wait for the next complete line. Returns `None` once the transport has
    /// closed and all buffered lines are drained.
    ///
    /// Cancel-safe: bytes read before cancellation stay in the framer.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.framer.next_line() {
                return Some(line);
            }
            if !self.connected {
                return None;
            }
            let result = self.stream.read_buf(self.framer.buffer_mut()).await;
            if let Some(line) = self.on_read(result) {
                return Some(line);
            }
        }
    }

    fn on_read(&mut self, result: std::io::Result<usize>) -> Option<String> {
        match result {
            Ok(0) => {
                warn!("Telemetry link closed by peer");
                self.connected = false;
                None
            }
            Ok(_) => {
                self.framer.enforce_limit();
                self.framer.next_line()
            }
            Err(e) => {
                warn!("Telemetry link read failed: {}", e);
                self.connected = false;
                None
            }
        }
    }

    /// Write one command line. Refused once the link is disconnected.
    pub async fn send_line(&mut self, line: &str) -> AppResult<()> {
        if !self.connected {
            return Err(DaqError::LinkClosed);
        }
        let payload = format!("{}{}", line, self.line_terminator);
        let written = async {
            self.stream.write_all(payload.as_bytes()).await?;
            self.stream.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                debug!("Sent rig command: {}", line);
                Ok(())
            }
            Err(e) => {
                warn!("Telemetry link write failed: {}", e);
                self.connected = false;
                Err(DaqError::LinkClosed)
            }
        }
    }

    /// Mark the link closed without touching the transport.
    pub fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn next_line_reassembles_chunks() {
        let (client, mut rig) = duplex(64);
        let mut link = TelemetryLink::new(client);

        rig.write_all(b"tare ").await.unwrap();
        rig.write_all(b"done\nready!\n").await.unwrap();

        assert_eq!(link.next_line().await.as_deref(), Some("tare done"));
        assert_eq!(link.next_line().await.as_deref(), Some("ready!"));
    }

    #[tokio::test]
    async fn poll_never_blocks() {
        let (client, mut rig) = duplex(64);
        let mut link = TelemetryLink::new(client);

        assert_eq!(link.poll(), None);
        rig.write_all(b"jog done\n").await.unwrap();
        assert_eq!(link.poll().as_deref(), Some("jog done"));
        assert_eq!(link.poll(), None);
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn closed_transport_reads_as_disconnected() {
        let (client, mut rig) = duplex(64);
        let mut link = TelemetryLink::new(client);

        rig.write_all(b"homing done\npartial").await.unwrap();
        drop(rig);

        assert_eq!(link.next_line().await.as_deref(), Some("homing done"));
        assert_eq!(link.next_line().await, None);
        assert!(!link.is_connected());
        assert!(matches!(
            link.send_line("stop").await,
            Err(DaqError::LinkClosed)
        ));
    }

    #[tokio::test]
    async fn scripted_exchange_then_read_error() {
        let transport = tokio_test::io::Builder::new()
            .write(b"tare\n")
            .read(b"tare done\r\n")
            .read_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "unplugged",
            ))
            .build();
        let mut link = TelemetryLink::new(transport);

        link.send_line("tare").await.unwrap();
        assert_eq!(link.next_line().await.as_deref(), Some("tare done"));
        assert_eq!(link.next_line().await, None);
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn unterminated_flood_stays_bounded() {
        let (client, mut rig) = duplex(1024);
        let mut link = TelemetryLink::new(client);

        let writer = tokio::spawn(async move {
            rig.write_all(&vec![b'x'; 100_000]).await.unwrap();
            rig.write_all(b"\nready!\n").await.unwrap();
            rig
        });

        let remnant = link.next_line().await.unwrap();
        assert!(remnant.len() <= line_framer::MAX_LINE_LEN);
        assert_eq!(link.next_line().await.as_deref(), Some("ready!"));
        assert_eq!(link.framer.pending(), 0);
        assert!(link.is_connected());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn flood_without_terminator_never_exceeds_cap() {
        let (client, mut rig) = duplex(1024);
        let mut link = TelemetryLink::new(client);

        tokio::spawn(async move {
            rig.write_all(&vec![b'x'; 100_000]).await.unwrap();
            // Hold the pipe open so reads keep pending.
            std::future::pending::<()>().await;
        });

        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(200), link.next_line()).await;
        assert!(waited.is_err());
        assert!(link.framer.pending() <= line_framer::MAX_LINE_LEN);
    }

    #[tokio::test]
    async fn send_line_appends_terminator() {
        let (client, mut rig) = duplex(64);
        let mut link = TelemetryLink::new(client).with_line_terminator("\r\n");

        link.send_line("tare").await.unwrap();

        let mut buf = [0u8; 6];
        rig.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tare\r\n");
    }
}
