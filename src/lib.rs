//! # stab_daq
//!
//! Sequential sweep measurements for SCPI lab instruments.
//!
//! A measurement is described by a [`MeasurementSettings`] value: up to
//! sixteen swept outputs, up to three sampled inputs, and the timing and file
//! options around them. Settings are queued on a waiting list and executed
//! strictly one after another; every sweep ends by ramping its outputs back to
//! a safe value.
//!
//! ## Crate Structure
//!
//! - **`transport`**: byte-level links to instruments (VISA/GPIB, serial,
//!   raw TCP, LeCroy VICP) plus an in-memory mock.
//! - **`parameter`**: typed parameter values, access rules and bounds.
//! - **`instrument`**: the `Instrument` trait, the table-driven SCPI driver,
//!   a virtual instrument and the registry built from configuration.
//! - **`settings`**: the Measurement Settings Object and its JSON files.
//! - **`sweep`**: axis vectors, point ordering and duration estimates.
//! - **`ramp`**: step-limited moves of source outputs.
//! - **`executor`**: runs one sweep and writes its data file.
//! - **`queue`** / **`runner`**: the waiting list and the actor that drains it.
//! - **`datafile`**: on-disk layout of measurement data.
//! - **`config`**, **`logging`**, **`error`**: ambient plumbing.

pub mod config;
pub mod datafile;
pub mod error;
pub mod executor;
pub mod instrument;
pub mod logging;
pub mod parameter;
pub mod queue;
pub mod ramp;
pub mod runner;
pub mod settings;
pub mod state;
pub mod sweep;
pub mod transport;

pub use config::LabConfig;
pub use error::{AppResult, DaqError};
pub use executor::{AbortSignal, SweepExecutor, SweepReport};
pub use instrument::{Instrument, InstrumentRegistry};
pub use runner::{QueueHandle, QueueRunner};
pub use settings::MeasurementSettings;
