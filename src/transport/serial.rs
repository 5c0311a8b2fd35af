//! RS-232 / USB-serial transport.
//!
//! Wraps the `serialport` crate. Serial I/O is blocking, so every call runs on
//! Tokio's blocking pool with the port behind an `Arc<Mutex<..>>`.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::Transport;
use crate::error::DaqError;

#[cfg(feature = "instrument_serial")]
use anyhow::{anyhow, Context};
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

#[cfg(feature = "instrument_serial")]
type PortHandle = Arc<Mutex<Box<dyn SerialPort>>>;
#[cfg(not(feature = "instrument_serial"))]
type PortHandle = Arc<Mutex<()>>;

/// Serial transport for RS-232 instruments
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    /// Appended to every command (e.g., "\r\n")
    line_terminator: String,
    /// Last byte of every response (e.g., '\n')
    response_delimiter: char,
    port: Option<PortHandle>,
}

impl SerialTransport {
    /// Create a serial transport with default framing (`\r\n` out, `\n` in).
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_secs(2),
            line_terminator: "\r\n".to_string(),
            response_delimiter: '\n',
            port: None,
        }
    }

    /// Set read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    /// Set response delimiter character
    pub fn with_response_delimiter(mut self, delimiter: char) -> Self {
        self.response_delimiter = delimiter;
        self
    }

    fn handle(&self) -> Result<PortHandle> {
        self.port
            .clone()
            .ok_or(DaqError::TransportNotConnected)
            .map_err(anyhow::Error::from)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    fn info(&self) -> String {
        format!(
            "SerialTransport({} @ {} baud, {}ms timeout)",
            self.port_name,
            self.baud_rate,
            self.timeout.as_millis()
        )
    }

    #[cfg(feature = "instrument_serial")]
    async fn connect(&mut self) -> Result<()> {
        let port_name = self.port_name.clone();
        let baud_rate = self.baud_rate;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&port_name, baud_rate)
                // Short internal timeout; the overall deadline is enforced in `read`
                .timeout(Duration::from_millis(100))
                .open()
                .with_context(|| {
                    format!("Failed to open serial port '{port_name}' at {baud_rate} baud")
                })
        })
        .await
        .context("Serial open task panicked")??;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
        Ok(())
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn connect(&mut self) -> Result<()> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    #[cfg(feature = "instrument_serial")]
    async fn write(&mut self, command: &str) -> Result<()> {
        let port = self.handle()?;
        let payload = format!("{}{}", command, self.line_terminator);
        let command_for_log = command.to_string();

        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let mut port_guard = port.blocking_lock();
            port_guard
                .write_all(payload.as_bytes())
                .context("Failed to write to serial port")?;
            port_guard.flush().context("Failed to flush serial port")?;
            debug!("Sent serial command: {}", command_for_log);
            Ok(())
        })
        .await
        .context("Serial I/O task panicked")?
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn write(&mut self, _command: &str) -> Result<()> {
        let _ = self.handle()?;
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
    }

    #[cfg(feature = "instrument_serial")]
    async fn read(&mut self) -> Result<String> {
        let port = self.handle()?;
        let delimiter = self.response_delimiter;
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            use std::io::Read;

            let mut port_guard = port.blocking_lock();
            let mut response = Vec::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();

            loop {
                if start.elapsed() > timeout {
                    return Err(DaqError::TransportTimeout(timeout).into());
                }

                match port_guard.read(&mut buffer) {
                    Ok(0) => return Err(DaqError::TransportUnexpectedEof.into()),
                    Ok(_) => {
                        response.push(buffer[0]);
                        if buffer[0] as char == delimiter {
                            break;
                        }
                    }
                    // Port timeout is shorter than the overall deadline
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                }
            }

            let response = String::from_utf8_lossy(&response).trim().to_string();
            debug!("Received serial response: {}", response);
            Ok(response)
        })
        .await
        .context("Serial I/O task panicked")?
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn read(&mut self) -> Result<String> {
        let _ = self.handle()?;
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_builder() {
        let transport = SerialTransport::new("/dev/ttyUSB0".to_string(), 9600)
            .with_timeout(Duration::from_millis(1500))
            .with_line_terminator("\r".to_string())
            .with_response_delimiter('\r');

        assert_eq!(transport.timeout, Duration::from_millis(1500));
        assert_eq!(transport.line_terminator, "\r");
        assert_eq!(transport.response_delimiter, '\r');
        assert!(transport.info().contains("/dev/ttyUSB0 @ 9600 baud"));
    }

    #[tokio::test]
    async fn test_write_before_connect_fails() {
        let mut transport = SerialTransport::new("/dev/null-port".to_string(), 9600);
        let err = transport.write("*IDN?").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::TransportNotConnected)
        ));
    }
}
