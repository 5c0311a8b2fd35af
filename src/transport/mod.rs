//! Pluggable instrument transports.
//!
//! A [`Transport`] moves ASCII command strings to an instrument and reads its
//! replies. Drivers never know which bus they are on: the same SCPI parameter
//! table works over a serial port, a VISA session, a raw socket or VICP.
//!
//! All transports share the same framing contract: `write` appends the
//! configured terminator, `read` returns one reply with trailing whitespace
//! and delimiters trimmed, and both fail with
//! [`DaqError::TransportNotConnected`](crate::error::DaqError) before
//! `connect`.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::TransportConfig;

pub mod mock;
pub mod serial;
pub mod tcp;
pub mod vicp;
pub mod visa;

pub use mock::MockTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use vicp::VicpTransport;
pub use visa::VisaTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport type name ("serial", "visa", "tcp", "vicp", "mock").
    fn name(&self) -> &str;

    /// Human readable connection summary for logs.
    fn info(&self) -> String;

    /// Open the underlying session.
    async fn connect(&mut self) -> Result<()>;

    /// Close the underlying session. Closing twice is not an error.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether `connect` has succeeded and `disconnect` has not been called.
    fn is_connected(&self) -> bool;

    /// Send one command.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Read one reply.
    async fn read(&mut self) -> Result<String>;

    /// Send a command and read its reply.
    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        self.read().await
    }
}

/// Build the transport described by `config`. Nothing is opened until
/// [`Transport::connect`] is called.
pub fn from_config(config: &TransportConfig) -> Box<dyn Transport> {
    match config {
        TransportConfig::Serial {
            port,
            baud_rate,
            timeout,
            terminator,
            delimiter,
        } => Box::new(
            SerialTransport::new(port.clone(), *baud_rate)
                .with_timeout(*timeout)
                .with_line_terminator(terminator.clone())
                .with_response_delimiter(*delimiter),
        ),
        TransportConfig::Visa {
            resource,
            timeout,
            terminator,
        } => Box::new(
            VisaTransport::new(resource.clone())
                .with_timeout(*timeout)
                .with_line_terminator(terminator.clone()),
        ),
        TransportConfig::Tcp {
            address,
            timeout,
            terminator,
            delimiter,
        } => Box::new(
            TcpTransport::new(address.clone())
                .with_timeout(*timeout)
                .with_line_terminator(terminator.clone())
                .with_response_delimiter(*delimiter),
        ),
        TransportConfig::Vicp { address, timeout } => {
            Box::new(VicpTransport::new(address.clone()).with_timeout(*timeout))
        }
        TransportConfig::Mock { responses } => {
            let mut transport = MockTransport::new();
            for (query, reply) in responses {
                transport = transport.with_response(query.clone(), reply.clone());
            }
            Box::new(transport)
        }
    }
}
