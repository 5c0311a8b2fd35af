//! Raw SCPI-over-socket transport (LXI port 5025 and friends).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::Transport;
use crate::error::DaqError;

/// Line-oriented TCP transport.
pub struct TcpTransport {
    address: String,
    timeout: Duration,
    line_terminator: String,
    response_delimiter: char,
    stream: Option<BufReader<TcpStream>>,
}

impl TcpTransport {
    /// Create a TCP transport for `host:port`.
    pub fn new(address: String) -> Self {
        Self {
            address,
            timeout: Duration::from_secs(2),
            line_terminator: "\n".to_string(),
            response_delimiter: '\n',
            stream: None,
        }
    }

    /// Set connect and read timeout
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

    fn stream(&mut self) -> Result<&mut BufReader<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or(DaqError::TransportNotConnected)
            .map_err(anyhow::Error::from)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn info(&self) -> String {
        format!(
            "TcpTransport({} @ {}ms timeout)",
            self.address,
            self.timeout.as_millis()
        )
    }

    async fn connect(&mut self) -> Result<()> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| DaqError::TransportTimeout(self.timeout))?
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        stream.set_nodelay(true)?;
        self.stream = Some(BufReader::new(stream));
        debug!(address = %self.address, "TCP session opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone
            let _ = stream.get_mut().shutdown().await;
            debug!(address = %self.address, "TCP session closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let payload = format!("{}{}", command, self.line_terminator);
        let stream = self.stream()?;
        stream
            .get_mut()
            .write_all(payload.as_bytes())
            .await
            .with_context(|| format!("Failed to write TCP command: {command}"))?;
        debug!("Sent TCP command: {}", command);
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        let timeout = self.timeout;
        let delimiter = self.response_delimiter as u8;
        let stream = self.stream()?;

        let mut buf = Vec::new();
        let Ok(read) = tokio::time::timeout(timeout, stream.read_until(delimiter, &mut buf)).await
        else {
            // A late tail of this reply would be taken as the next response
            warn!(address = %self.address, "TCP read timed out, closing session");
            self.stream = None;
            return Err(DaqError::TransportTimeout(timeout).into());
        };
        let read = read.context("Failed to read TCP response")?;
        if read == 0 {
            return Err(DaqError::TransportUnexpectedEof.into());
        }

        let response = String::from_utf8_lossy(&buf).trim().to_string();
        debug!("Received TCP response: {}", response);
        Ok(response)
    }
}
