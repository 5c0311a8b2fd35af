//! In-memory SCPI device for dry runs and tests.
//!
//! Behaves like a forgiving SCPI instrument:
//! - `KEY value` stores `value` under `KEY`
//! - `KEY?` replies with a scripted response if one exists, else the stored
//!   value of `KEY`
//! - `read` without a pending reply times out, like a real bus would
//!
//! Every command is logged so tests can assert on the exact strings a driver
//! produced, even after the transport has been moved into an instrument.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::Transport;
use crate::error::DaqError;

#[derive(Debug, Default)]
struct MockState {
    responses: HashMap<String, String>,
    values: HashMap<String, String>,
    pending: VecDeque<String>,
    writes: Vec<String>,
    fail_next: bool,
}

/// Shared view of a [`MockTransport`]'s state.
#[derive(Debug, Clone, Default)]
pub struct MockTransportHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransportHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the log from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every command written so far, without terminators.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Forget the command log.
    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Script the reply to `query`.
    pub fn set_response(&self, query: impl Into<String>, reply: impl Into<String>) {
        self.lock().responses.insert(query.into(), reply.into());
    }

    /// Value last written with `KEY value`.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).cloned()
    }

    /// Make the next write fail.
    pub fn fail_next(&self) {
        self.lock().fail_next = true;
    }
}

/// Simulated SCPI transport.
#[derive(Debug)]
pub struct MockTransport {
    handle: MockTransportHandle,
    connected: bool,
    timeout: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create an empty mock device.
    pub fn new() -> Self {
        Self {
            handle: MockTransportHandle::default(),
            connected: false,
            timeout: Duration::from_millis(100),
        }
    }

    /// Script the reply to `query`.
    pub fn with_response(self, query: impl Into<String>, reply: impl Into<String>) -> Self {
        self.handle.set_response(query, reply);
        self
    }

    /// Handle for inspecting the device after the transport is moved.
    pub fn handle(&self) -> MockTransportHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn info(&self) -> String {
        "MockTransport(in-memory)".to_string()
    }

    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.handle.lock().pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        if !self.connected {
            return Err(DaqError::TransportNotConnected.into());
        }

        let mut state = self.handle.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(DaqError::Instrument(format!("mock write failed: {command}")).into());
        }
        state.writes.push(command.to_string());
        debug!("Mock command: {}", command);

        let command = command.trim();
        if let Some(key) = command.strip_suffix('?') {
            let reply = state
                .responses
                .get(command)
                .or_else(|| state.values.get(key))
                .cloned();
            if let Some(reply) = reply {
                state.pending.push_back(reply);
            }
        } else if let Some((key, value)) = command.split_once(char::is_whitespace) {
            state
                .values
                .insert(key.to_string(), value.trim().to_string());
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        if !self.connected {
            return Err(DaqError::TransportNotConnected.into());
        }
        self.handle
            .lock()
            .pending
            .pop_front()
            .ok_or_else(|| DaqError::TransportTimeout(self.timeout).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_query_echoes_value() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.unwrap();

        transport.write("SOUR:VOLT 1.5").await.unwrap();
        assert_eq!(transport.query("SOUR:VOLT?").await.unwrap(), "1.5");
        assert_eq!(handle.value("SOUR:VOLT").as_deref(), Some("1.5"));
        assert_eq!(handle.writes(), vec!["SOUR:VOLT 1.5", "SOUR:VOLT?"]);
    }

    #[tokio::test]
    async fn test_scripted_response_wins() {
        let mut transport = MockTransport::new().with_response("*IDN?", "ACME,DMM,1,0.1");
        transport.connect().await.unwrap();
        assert_eq!(transport.query("*IDN?").await.unwrap(), "ACME,DMM,1,0.1");
    }

    #[tokio::test]
    async fn test_unknown_query_times_out() {
        let mut transport = MockTransport::new();
        transport.connect().await.unwrap();
        let err = transport.query("MEAS?").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::TransportTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_injection_is_one_shot() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.unwrap();

        handle.fail_next();
        assert!(transport.write("OUTP 1").await.is_err());
        assert!(transport.write("OUTP 1").await.is_ok());
        assert_eq!(handle.writes(), vec!["OUTP 1"]);
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let mut transport = MockTransport::new();
        let err = transport.write("*RST").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::TransportNotConnected)
        ));
    }
}
