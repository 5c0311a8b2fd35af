//! Custom error types for the application.
//!
//! `DaqError` is the single error enum shared by every layer of the crate, from
//! transport I/O up to the sweep queue. Async trait seams (`Transport`,
//! `Instrument`) return `anyhow::Result` so drivers can attach context; the
//! typed variants below travel inside those `anyhow::Error`s and can be
//! recovered with `downcast_ref::<DaqError>()`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment parse failures and semantic
//!   validation failures of the lab configuration.
//! - **`Io`** / **`Serialization`**: file system and JSON errors when writing
//!   data files or loading settings.
//! - **Transport variants**: connection state, timeouts, framing problems.
//! - **Parameter variants**: unknown names, access violations, bounds.
//! - **Queue variants**: capacity and position errors from the waiting list.

use std::time::Duration;
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

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Transport not connected")]
    TransportNotConnected,

    #[error("Transport read timed out after {0:?}")]
    TransportTimeout(Duration),

    #[error("Unexpected EOF from transport")]
    TransportUnexpectedEof,

    #[error("Malformed transport frame: {0}")]
    TransportFraming(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Unknown instrument '{0}'")]
    UnknownInstrument(String),

    #[error("Instrument '{instrument}' has no parameter '{parameter}'")]
    UnknownParameter {
        instrument: String,
        parameter: String,
    },

    #[error("Parameter '{0}' is read-only")]
    ParameterReadOnly(String),

    #[error("Parameter '{0}' is write-only and has no cached value")]
    ParameterWriteOnly(String),

    #[error("Parameter '{name}' value {value} outside [{min}, {max}]")]
    ParameterOutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid value for parameter '{name}': {reason}")]
    ParameterInvalidValue { name: String, reason: String },

    #[error("Invalid measurement settings: {0}")]
    InvalidSettings(String),

    #[error("Measurement queue is full ({0} entries)")]
    QueueFull(usize),

    #[error("No queued measurement at position {0}")]
    QueueIndexOutOfRange(usize),

    #[error("Measurement aborted")]
    Aborted,

    #[error("Queue runner is not running")]
    RunnerStopped,

    #[error("Shutdown failed with errors: {}", join_errors(.0))]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

fn join_errors(errors: &[DaqError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
