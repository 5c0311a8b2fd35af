//! LeCroy VICP (Versatile Instrument Control Protocol) transport.
//!
//! VICP carries GPIB-style messages over TCP port 1861. Every block on the wire
//! is an 8-byte header followed by the payload:
//!
//! ```text
//! byte 0    operation flags (DATA, REMOTE, LOCKOUT, CLEAR, SRQ, SERIAL_POLL, EOI)
//! byte 1    protocol version (1)
//! byte 2    sequence number (1..=255, wraps to 1)
//! byte 3    spare (0)
//! byte 4-7  payload length, big-endian u32
//! ```
//!
//! A reply may span several DATA blocks; the one carrying EOI ends it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::Transport;
use crate::error::DaqError;

/// Default VICP port.
pub const VICP_PORT: u16 = 1861;
/// Header length in bytes.
pub const HEADER_LEN: usize = 8;
/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Replies larger than this are treated as framing errors.
const MAX_BLOCK_LEN: u32 = 64 * 1024 * 1024;

/// Operation flag bits.
pub mod flags {
    /// Block carries payload data
    pub const DATA: u8 = 0x80;
    /// Remote mode
    pub const REMOTE: u8 = 0x40;
    /// Local lockout
    pub const LOCKOUT: u8 = 0x20;
    /// Device clear
    pub const CLEAR: u8 = 0x10;
    /// Service request (device to host)
    pub const SRQ: u8 = 0x08;
    /// Serial poll request
    pub const SERIAL_POLL: u8 = 0x04;
    /// End of message
    pub const EOI: u8 = 0x01;
}

/// Decoded VICP block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VicpHeader {
    /// Operation flags
    pub operation: u8,
    /// Protocol version
    pub version: u8,
    /// Sequence number
    pub sequence: u8,
    /// Payload length
    pub length: u32,
}

impl VicpHeader {
    /// Header for a data block.
    pub fn data(sequence: u8, length: u32, eoi: bool) -> Self {
        let mut operation = flags::DATA | flags::REMOTE;
        if eoi {
            operation |= flags::EOI;
        }
        Self {
            operation,
            version: PROTOCOL_VERSION,
            sequence,
            length,
        }
    }

    /// Append the 8 wire bytes to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8(self.operation);
        buf.put_u8(self.version);
        buf.put_u8(self.sequence);
        buf.put_u8(0);
        buf.put_u32(self.length);
    }

    /// Decode a header from exactly 8 bytes.
    pub fn decode(mut raw: &[u8]) -> Result<Self, DaqError> {
        if raw.len() != HEADER_LEN {
            return Err(DaqError::TransportFraming(format!(
                "VICP header must be {HEADER_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let operation = raw.get_u8();
        let version = raw.get_u8();
        let sequence = raw.get_u8();
        let _spare = raw.get_u8();
        let length = raw.get_u32();

        if version != PROTOCOL_VERSION {
            return Err(DaqError::TransportFraming(format!(
                "Unsupported VICP version {version}"
            )));
        }
        if length > MAX_BLOCK_LEN {
            return Err(DaqError::TransportFraming(format!(
                "VICP block of {length} bytes exceeds limit"
            )));
        }

        Ok(Self {
            operation,
            version,
            sequence,
            length,
        })
    }

    /// Whether the block carries payload.
    pub fn is_data(&self) -> bool {
        self.operation & flags::DATA != 0
    }

    /// Whether the block ends the message.
    pub fn is_eoi(&self) -> bool {
        self.operation & flags::EOI != 0
    }
}

/// Next sequence number after `current`; 0 is never used.
pub fn next_sequence(current: u8) -> u8 {
    if current == u8::MAX {
        1
    } else {
        current + 1
    }
}

/// VICP transport for LeCroy oscilloscopes.
pub struct VicpTransport {
    address: String,
    timeout: Duration,
    sequence: u8,
    stream: Option<TcpStream>,
}

impl VicpTransport {
    /// Create a VICP transport. `address` may omit the port.
    pub fn new(address: String) -> Self {
        let address = if address.contains(':') {
            address
        } else {
            format!("{address}:{VICP_PORT}")
        };
        Self {
            address,
            timeout: Duration::from_secs(2),
            sequence: 0,
            stream: None,
        }
    }

    /// Set connect and read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or(DaqError::TransportNotConnected)
            .map_err(anyhow::Error::from)
    }

    fn close_session(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            warn!(address = %self.address, reason, "Closing VICP session");
        }
    }

    async fn read_block(stream: &mut TcpStream) -> Result<(VicpHeader, Vec<u8>)> {
        let mut raw = [0u8; HEADER_LEN];
        stream.read_exact(&mut raw).await.map_err(eof_or_io)?;
        let header = VicpHeader::decode(&raw)?;
        let mut payload = vec![0u8; header.length as usize];
        stream.read_exact(&mut payload).await.map_err(eof_or_io)?;
        trace!(?header, "VICP block received");
        Ok((header, payload))
    }
}

fn eof_or_io(err: std::io::Error) -> anyhow::Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        DaqError::TransportUnexpectedEof.into()
    } else {
        anyhow::Error::new(err).context("VICP read failed")
    }
}

#[async_trait]
impl Transport for VicpTransport {
    fn name(&self) -> &str {
        "vicp"
    }

    fn info(&self) -> String {
        format!(
            "VicpTransport({} @ {}ms timeout)",
            self.address,
            self.timeout.as_millis()
        )
    }

    async fn connect(&mut self) -> Result<()> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| DaqError::TransportTimeout(self.timeout))?
            .with_context(|| format!("Failed to connect to VICP device {}", self.address))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.sequence = 0;
        debug!(address = %self.address, "VICP session opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(address = %self.address, "VICP session closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        // Fail before advancing the sequence number
        self.stream()?;
        self.sequence = next_sequence(self.sequence);

        let payload = command.as_bytes();
        let length = u32::try_from(payload.len())
            .map_err(|_| DaqError::TransportFraming("VICP command too long".to_string()))?;
        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        VicpHeader::data(self.sequence, length, true).encode(&mut frame);
        frame.put_slice(payload);

        let stream = self.stream()?;
        stream
            .write_all(&frame)
            .await
            .with_context(|| format!("Failed to write VICP command: {command}"))?;
        debug!("Sent VICP command: {}", command);
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        let timeout = self.timeout;
        let stream = self.stream()?;

        let collect = async move {
            let mut message = Vec::new();
            loop {
                let (header, payload) = Self::read_block(stream).await?;
                if header.is_data() {
                    message.extend_from_slice(&payload);
                }
                if header.is_eoi() {
                    return Ok::<_, anyhow::Error>(message);
                }
            }
        };

        let message = match tokio::time::timeout(timeout, collect).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                // Block boundaries are lost
                self.close_session("VICP read failed");
                return Err(e);
            }
            Err(_) => {
                self.close_session("VICP read timed out");
                return Err(DaqError::TransportTimeout(timeout).into());
            }
        };
        let response = String::from_utf8_lossy(&message).trim().to_string();
        debug!("Received VICP response: {}", response);
        Ok(response)
    }
}
