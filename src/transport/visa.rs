//! VISA transport for GPIB/USB/Ethernet instruments
//!
//! Wraps `visa-rs`. Supports resource strings like:
//! - "GPIB0::22::INSTR" (GPIB interface)
//! - "USB0::0x0957::0x0607::MY47000000::INSTR" (USB-TMC)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//!
//! The resource manager must outlive every session opened from it, so both are
//! kept together in one session value.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::Transport;
use crate::error::DaqError;

#[cfg(feature = "instrument_visa")]
use anyhow::{anyhow, Context};
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;

#[cfg(feature = "instrument_visa")]
struct VisaSession {
    _rm: visa_rs::DefaultRM,
    instrument: visa_rs::Instrument,
}

/// VISA transport for instrument communication
pub struct VisaTransport {
    /// VISA resource string (e.g., "GPIB0::22::INSTR")
    resource_string: String,
    timeout: Duration,
    /// Line terminator for commands (typically "\n" for SCPI)
    line_terminator: String,
    #[cfg(feature = "instrument_visa")]
    session: Option<Arc<Mutex<VisaSession>>>,
    #[cfg(not(feature = "instrument_visa"))]
    session: Option<()>,
}

impl VisaTransport {
    /// Create a VISA transport with a 2 s timeout and `\n` terminator.
    pub fn new(resource_string: String) -> Self {
        Self {
            resource_string,
            timeout: Duration::from_secs(2),
            line_terminator: "\n".to_string(),
            session: None,
        }
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    /// The VISA resource string.
    pub fn resource(&self) -> &str {
        &self.resource_string
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl Transport for VisaTransport {
    fn name(&self) -> &str {
        "visa"
    }

    fn info(&self) -> String {
        format!(
            "VisaTransport({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }

    async fn connect(&mut self) -> Result<()> {
        use std::ffi::CString;
        use visa_rs::prelude::*;

        let resource = self.resource_string.clone();
        let timeout = self.timeout;
        let session = tokio::task::spawn_blocking(move || -> Result<VisaSession> {
            let rm = DefaultRM::new()
                .map_err(|e| anyhow!("Failed to initialize VISA resource manager: {e:?}"))?;
            let name = CString::new(resource.clone())
                .with_context(|| format!("Invalid VISA resource string '{resource}'"))?;
            let instrument = rm
                .open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| anyhow!("Failed to open VISA resource '{resource}': {e:?}"))?;
            Ok(VisaSession {
                _rm: rm,
                instrument,
            })
        })
        .await
        .context("VISA open task panicked")??;

        self.session = Some(Arc::new(Mutex::new(session)));
        debug!(resource = %self.resource_string, "VISA session opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.session.take().is_some() {
            debug!(resource = %self.resource_string, "VISA session closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let session = self
            .session
            .clone()
            .ok_or(DaqError::TransportNotConnected)?;
        let payload = format!("{}{}", command, self.line_terminator);
        let command = command.to_string();

        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let mut guard = session.blocking_lock();
            guard
                .instrument
                .write_all(payload.as_bytes())
                .with_context(|| format!("Failed to write VISA command: {command}"))?;
            debug!("Sent VISA command: {}", command);
            Ok(())
        })
        .await
        .context("VISA I/O task panicked")?
    }

    async fn read(&mut self) -> Result<String> {
        let session = self
            .session
            .clone()
            .ok_or(DaqError::TransportNotConnected)?;

        tokio::task::spawn_blocking(move || {
            use std::io::{BufRead, BufReader};

            let guard = session.blocking_lock();
            let mut response = String::new();
            let mut reader = BufReader::new(&guard.instrument);
            let read = reader
                .read_line(&mut response)
                .context("Failed to read VISA response")?;
            if read == 0 {
                return Err(DaqError::TransportUnexpectedEof.into());
            }
            let response = response.trim().to_string();
            debug!("Received VISA response: {}", response);
            Ok(response)
        })
        .await
        .context("VISA I/O task panicked")?
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl Transport for VisaTransport {
    fn name(&self) -> &str {
        "visa"
    }

    fn info(&self) -> String {
        format!(
            "VisaTransport({} @ {}ms timeout, disabled)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }

    async fn connect(&mut self) -> Result<()> {
        debug!(resource = %self.resource_string, "VISA support not compiled in");
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()).into())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.session = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn write(&mut self, _command: &str) -> Result<()> {
        Err(DaqError::TransportNotConnected.into())
    }

    async fn read(&mut self) -> Result<String> {
        Err(DaqError::TransportNotConnected.into())
    }
}
