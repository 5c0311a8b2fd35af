//! Instrument driver abstraction.
//!
//! An [`Instrument`] is a black box with a fixed table of named parameters.
//! The sweep executor only ever calls `get` and `set`; how those become bus
//! traffic is the driver's business.
//!
//! - [`ScpiInstrument`]: generic, table-driven SCPI driver over any
//!   [`Transport`](crate::transport::Transport)
//! - [`MockInstrument`]: in-memory virtual device for dry runs and tests
//! - [`InstrumentRegistry`]: the set of instruments declared active

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::DaqError;
use crate::parameter::{ParameterSpec, ParameterValue};

pub mod mock;
pub mod registry;
pub mod scpi;

pub use mock::MockInstrument;
pub use registry::InstrumentRegistry;
pub use scpi::ScpiInstrument;

#[async_trait]
pub trait Instrument: Send + Sync {
    /// Unique instrument identifier from the configuration.
    fn id(&self) -> &str;

    /// Driver name ("scpi", "mock").
    fn driver(&self) -> &str;

    /// Every parameter this instrument exposes, sorted by name.
    async fn parameter_specs(&self) -> Vec<ParameterSpec>;

    /// Open the session and run any init sequence.
    async fn connect(&self) -> Result<()>;

    /// Close the session.
    async fn disconnect(&self) -> Result<()>;

    /// Read a parameter, refreshing the cache.
    async fn get(&self, name: &str) -> Result<ParameterValue>;

    /// Validate and write a parameter, updating the cache.
    async fn set(&self, name: &str, value: ParameterValue) -> Result<()>;

    /// Last known value without touching the hardware.
    async fn cached(&self, name: &str) -> Option<ParameterValue>;

    /// All cached values.
    async fn snapshot(&self) -> BTreeMap<String, ParameterValue>;

    /// Identification string.
    async fn identify(&self) -> Result<String> {
        Ok(format!("{} ({})", self.id(), self.driver()))
    }

    /// Look up one parameter spec.
    async fn spec(&self, name: &str) -> Result<ParameterSpec> {
        self.parameter_specs()
            .await
            .into_iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| {
                DaqError::UnknownParameter {
                    instrument: self.id().to_string(),
                    parameter: name.to_string(),
                }
                .into()
            })
    }

    /// Read a parameter as a number.
    async fn get_f64(&self, name: &str) -> Result<f64> {
        let value = self.get(name).await?;
        value.as_f64().ok_or_else(|| {
            DaqError::ParameterInvalidValue {
                name: name.to_string(),
                reason: format!("'{value}' is not numeric"),
            }
            .into()
        })
    }

    /// Write a numeric parameter.
    async fn set_f64(&self, name: &str, value: f64) -> Result<()> {
        self.set(name, ParameterValue::Float(value)).await
    }
}
