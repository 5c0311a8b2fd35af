//! Lab configuration using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. A TOML file (`config/stabdaq.toml` unless told otherwise)
//! 3. Environment variables prefixed with `STABDAQ_`, using `__` to nest
//!
//! # Example
//! ```no_run
//! use stab_daq::config::LabConfig;
//!
//! let config = LabConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::parameter::{Access, ParameterValue, ValueKind};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/stabdaq.toml";

/// Top-level lab configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Data file output
    #[serde(default)]
    pub storage: StorageConfig,
    /// Waiting list limits
    #[serde(default)]
    pub queue: QueueConfig,
    /// Sweep execution tuning
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Data file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for measurement data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Write `<stem>.settings.json` next to each data file
    #[serde(default = "default_enabled")]
    pub write_settings_snapshot: bool,
    /// Write `<stem>.set` with every instrument's cached parameters
    #[serde(default = "default_enabled")]
    pub write_parameter_snapshot: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            write_settings_snapshot: true,
            write_parameter_snapshot: true,
        }
    }
}

/// Waiting list configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending measurements
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

/// Sweep execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Fixed per-point cost added to duration estimates (bus round trips)
    #[serde(default = "default_point_overhead", with = "humantime_serde")]
    pub point_overhead: Duration,
    /// Ramp step used for outputs that set neither a channel nor a parameter limit
    #[serde(default)]
    pub default_ramp_step: Option<f64>,
    /// Pause between consecutive ramp steps
    #[serde(default = "default_ramp_delay", with = "humantime_serde")]
    pub ramp_delay: Duration,
    /// Value outputs are ramped back to after a sweep
    #[serde(default)]
    pub safe_value: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            point_overhead: default_point_overhead(),
            default_ramp_step: None,
            ramp_delay: default_ramp_delay(),
            safe_value: 0.0,
        }
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Driver type ("scpi" or "mock")
    pub r#type: String,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How to reach the instrument (required for "scpi")
    #[serde(default)]
    pub transport: Option<TransportConfig>,
    /// Commands written once after connecting
    #[serde(default)]
    pub init: Vec<String>,
    /// Parameter table
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

/// One parameter of a configured instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Parameter name
    pub name: String,
    /// Value kind replies are cast to
    #[serde(default)]
    pub kind: ValueKind,
    /// Supported directions
    #[serde(default)]
    pub access: Access,
    /// Query string sent on get (e.g. `SOUR:VOLT?`)
    #[serde(default)]
    pub get: Option<String>,
    /// Command template sent on set; `{value}` is replaced (e.g. `SOUR:VOLT {value}`)
    #[serde(default)]
    pub set: Option<String>,
    /// Serve reads from the cache
    #[serde(default)]
    pub soft_get: bool,
    /// Inclusive lower bound
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive upper bound
    #[serde(default)]
    pub max: Option<f64>,
    /// Allowed text values
    #[serde(default)]
    pub choices: Vec<String>,
    /// Physical unit
    #[serde(default)]
    pub unit: Option<String>,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Largest single write; larger moves are ramped
    #[serde(default)]
    pub max_step: Option<f64>,
    /// Initial cached value (mock instruments start from it)
    #[serde(default)]
    pub initial: Option<ParameterValue>,
}

/// Transport selection, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// RS-232 / USB serial port
    Serial {
        /// Port path (e.g., "/dev/ttyUSB0", "COM3")
        port: String,
        /// Baud rate
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Response timeout
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
        /// Appended to every command
        #[serde(default = "default_serial_terminator")]
        terminator: String,
        /// Ends every response
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
    /// VISA resource (GPIB, USB-TMC, LXI)
    Visa {
        /// Resource string (e.g., "GPIB0::22::INSTR")
        resource: String,
        /// Response timeout
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
        /// Appended to every command
        #[serde(default = "default_scpi_terminator")]
        terminator: String,
    },
    /// Raw SCPI socket
    Tcp {
        /// host:port (e.g., "192.168.1.20:5025")
        address: String,
        /// Response timeout
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
        /// Appended to every command
        #[serde(default = "default_scpi_terminator")]
        terminator: String,
        /// Ends every response
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
    /// LeCroy VICP over TCP
    Vicp {
        /// Host name or address; port 1861 is used when none is given
        address: String,
        /// Response timeout
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
    /// In-memory simulated device
    Mock {
        /// Canned replies keyed by query string
        #[serde(default)]
        responses: BTreeMap<String, String>,
    },
}

// Default value functions
fn default_app_name() -> String {
    "stab_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_entries() -> usize {
    64
}

fn default_point_overhead() -> Duration {
    Duration::from_millis(5)
}

fn default_ramp_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_enabled() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_serial_terminator() -> String {
    "\r\n".to_string()
}

fn default_scpi_terminator() -> String {
    "\n".to_string()
}

fn default_delimiter() -> char {
    '\n'
}

impl LabConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Environment variables override the file with prefix `STABDAQ_`.
    /// Example: `STABDAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The layered provider chain, exposed so callers can add their own layers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(LabConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STABDAQ_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.queue.max_entries == 0 {
            return Err(invalid("queue.max_entries must be at least 1".to_string()));
        }

        if let Some(step) = self.sweep.default_ramp_step {
            if !(step.is_finite() && step > 0.0) {
                return Err(invalid(format!(
                    "sweep.default_ramp_step must be positive, got {step}"
                )));
            }
        }

        if !self.sweep.safe_value.is_finite() {
            return Err(invalid("sweep.safe_value must be finite".to_string()));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(&instrument.id) {
                return Err(invalid(format!("Duplicate instrument ID: {}", instrument.id)));
            }
            instrument.validate()?;
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.enabled)
            .collect()
    }
}

impl InstrumentDefinition {
    fn validate(&self) -> AppResult<()> {
        if self.id.trim().is_empty() {
            return Err(invalid("Instrument ID must not be empty".to_string()));
        }

        match self.r#type.as_str() {
            "scpi" => {
                if self.transport.is_none() {
                    return Err(invalid(format!(
                        "Instrument '{}' has type 'scpi' but no transport",
                        self.id
                    )));
                }
            }
            "mock" => {}
            other => {
                return Err(invalid(format!(
                    "Instrument '{}' has unknown type '{}'. Must be one of: scpi, mock",
                    self.id, other
                )));
            }
        }

        let mut names = HashSet::new();
        for param in &self.parameters {
            if !names.insert(&param.name) {
                return Err(invalid(format!(
                    "Instrument '{}' declares parameter '{}' twice",
                    self.id, param.name
                )));
            }
            if let (Some(min), Some(max)) = (param.min, param.max) {
                if min > max {
                    return Err(invalid(format!(
                        "Parameter '{}.{}' has min {} > max {}",
                        self.id, param.name, min, max
                    )));
                }
            }
            if let Some(step) = param.max_step {
                if !(step.is_finite() && step > 0.0) {
                    return Err(invalid(format!(
                        "Parameter '{}.{}' max_step must be positive",
                        self.id, param.name
                    )));
                }
            }
            if self.r#type == "scpi" {
                if param.access.can_set() && param.set.is_none() {
                    return Err(invalid(format!(
                        "Parameter '{}.{}' is settable but has no set template",
                        self.id, param.name
                    )));
                }
                if param.access.can_get() && param.get.is_none() && !param.soft_get {
                    return Err(invalid(format!(
                        "Parameter '{}.{}' is gettable but has no get query",
                        self.id, param.name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> DaqError {
    DaqError::Configuration(message)
}
