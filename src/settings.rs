//! Measurement settings.
//!
//! A [`MeasurementSettings`] is the flat record describing one sweep: which
//! outputs are ramped over which ranges, which inputs are sampled, how long to
//! settle, where to write the data and how to plot it. It is what the operator
//! edits, what gets queued, and what is saved next to every data file.
//!
//! Gains convert between sample units (what the operator types and what the
//! data file holds) and instrument units:
//!
//! ```text
//! instrument setpoint = sample value / gain     (outputs)
//! sample value        = instrument reading / gain (inputs)
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Most output channels one sweep can drive.
pub const MAX_OUTPUT_CHANNELS: usize = 16;
/// Most input channels one sweep can read.
pub const MAX_INPUT_CHANNELS: usize = 3;

/// One swept output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputChannel {
    /// Column label in the data file
    pub label: String,
    /// Instrument id
    pub instrument: String,
    /// Parameter name on that instrument
    pub parameter: String,
    /// Whether the channel takes part in the sweep
    pub active: bool,
    /// First value, in sample units
    pub start: f64,
    /// Last value, in sample units
    pub stop: f64,
    /// Increment, in sample units; only its magnitude is used
    pub step: f64,
    /// Sample units per instrument unit
    pub gain: f64,
    /// Largest single move in instrument units; larger moves are ramped
    pub ramp_step: Option<f64>,
}

impl Default for OutputChannel {
    fn default() -> Self {
        Self {
            label: String::new(),
            instrument: String::new(),
            parameter: String::new(),
            active: false,
            start: 0.0,
            stop: 0.0,
            step: 0.0,
            gain: 1.0,
            ramp_step: None,
        }
    }
}

impl OutputChannel {
    /// Active channel sweeping `instrument.parameter`.
    pub fn new(
        label: impl Into<String>,
        instrument: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            instrument: instrument.into(),
            parameter: parameter.into(),
            active: true,
            ..Default::default()
        }
    }

    /// Set the sweep range.
    pub fn sweep(mut self, start: f64, stop: f64, step: f64) -> Self {
        self.start = start;
        self.stop = stop;
        self.step = step;
        self
    }

    /// Set the gain.
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    /// Set the ramp step.
    pub fn with_ramp_step(mut self, step: f64) -> Self {
        self.ramp_step = Some(step);
        self
    }

    /// Setpoint to send for a sample value.
    pub fn instrument_value(&self, sample: f64) -> f64 {
        sample / self.gain
    }
}

/// One sampled input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputChannel {
    /// Column label in the data file
    pub label: String,
    /// Instrument id
    pub instrument: String,
    /// Parameter name on that instrument
    pub parameter: String,
    /// Whether the channel is read
    pub active: bool,
    /// Instrument units per sample unit (e.g. amplifier gain)
    pub gain: f64,
}

impl Default for InputChannel {
    fn default() -> Self {
        Self {
            label: String::new(),
            instrument: String::new(),
            parameter: String::new(),
            active: false,
            gain: 1.0,
        }
    }
}

impl InputChannel {
    /// Active channel reading `instrument.parameter`.
    pub fn new(
        label: impl Into<String>,
        instrument: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            instrument: instrument.into(),
            parameter: parameter.into(),
            active: true,
            gain: 1.0,
        }
    }

    /// Set the gain.
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    /// Sample value for an instrument reading.
    pub fn sample_value(&self, reading: f64) -> f64 {
        reading / self.gain
    }
}

/// Plot hints, stored in the data file header for viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotFlags {
    /// Show a live line plot of the innermost axis
    pub line: bool,
    /// Show a live color map of the two innermost axes
    pub map: bool,
    /// Data column used as x axis (1-based)
    pub x_column: Option<usize>,
    /// Data columns plotted against it (1-based)
    pub y_columns: Vec<usize>,
}

impl Default for PlotFlags {
    fn default() -> Self {
        Self {
            line: true,
            map: false,
            x_column: None,
            y_columns: Vec::new(),
        }
    }
}

/// Everything needed to run one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    /// Measurement name, used in log lines
    pub name: String,
    /// Swept outputs; the first active one is the outermost loop
    pub outputs: Vec<OutputChannel>,
    /// Sampled inputs
    pub inputs: Vec<InputChannel>,
    /// Wait after moving outputs, before sampling
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Input sample rate
    pub sample_rate_hz: f64,
    /// Samples averaged per point
    pub samples_per_point: u32,
    /// Data file base name
    pub filename: String,
    /// Override of the configured data directory
    pub directory: Option<PathBuf>,
    /// Free text written into the header
    pub comment: String,
    /// Plot hints
    pub plot: PlotFlags,
    /// Ramp outputs to the safe value afterwards
    pub ramp_back: bool,
    /// Alternate the direction of inner axes on every outer step
    pub snake: bool,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            name: "measurement".to_string(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            settle_time: Duration::from_millis(100),
            sample_rate_hz: 1000.0,
            samples_per_point: 1,
            filename: "measurement".to_string(),
            directory: None,
            comment: String::new(),
            plot: PlotFlags::default(),
            ramp_back: true,
            snake: false,
        }
    }
}

impl MeasurementSettings {
    /// Fresh settings named `name`, writing to `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            filename: name.clone(),
            name,
            ..Default::default()
        }
    }

    /// Append an output channel.
    pub fn with_output(mut self, output: OutputChannel) -> Self {
        self.outputs.push(output);
        self
    }

    /// Append an input channel.
    pub fn with_input(mut self, input: InputChannel) -> Self {
        self.inputs.push(input);
        self
    }

    /// Outputs taking part in the sweep, in loop order.
    pub fn active_outputs(&self) -> impl Iterator<Item = &OutputChannel> {
        self.outputs.iter().filter(|ch| ch.active)
    }

    /// Inputs read at every point.
    pub fn active_inputs(&self) -> impl Iterator<Item = &InputChannel> {
        self.inputs.iter().filter(|ch| ch.active)
    }

    /// Spacing between consecutive samples of one point.
    pub fn sample_interval(&self) -> AppResult<Duration> {
        Duration::try_from_secs_f64(1.0 / self.sample_rate_hz).map_err(|_| {
            invalid(format!(
                "sample rate {} Hz gives no usable sample interval",
                self.sample_rate_hz
            ))
        })
    }

    /// Time spent acquiring samples at one point.
    pub fn sampling_time(&self) -> AppResult<Duration> {
        if self.active_inputs().next().is_none() || self.samples_per_point <= 1 {
            return Ok(Duration::ZERO);
        }
        // The first sample is taken immediately
        self.sample_interval()?
            .checked_mul(self.samples_per_point - 1)
            .ok_or_else(|| {
                invalid(format!(
                    "{} samples at {} Hz take too long",
                    self.samples_per_point, self.sample_rate_hz
                ))
            })
    }

    /// Check channel limits and that every active channel is usable.
    pub fn validate(&self) -> AppResult<()> {
        if self.outputs.len() > MAX_OUTPUT_CHANNELS {
            return Err(invalid(format!(
                "{} output channels, at most {MAX_OUTPUT_CHANNELS} allowed",
                self.outputs.len()
            )));
        }
        if self.inputs.len() > MAX_INPUT_CHANNELS {
            return Err(invalid(format!(
                "{} input channels, at most {MAX_INPUT_CHANNELS} allowed",
                self.inputs.len()
            )));
        }
        if self.filename.trim().is_empty() {
            return Err(invalid("filename must not be empty".to_string()));
        }
        if self.filename.contains(['/', '\\']) {
            return Err(invalid(format!(
                "filename '{}' must not contain path separators",
                self.filename
            )));
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(invalid(format!(
                "sample rate must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        if self.samples_per_point == 0 {
            return Err(invalid("samples_per_point must be at least 1".to_string()));
        }
        self.sample_interval()?;
        self.sampling_time()?;

        for (i, ch) in self.outputs.iter().enumerate().filter(|(_, ch)| ch.active) {
            let which = format!("output {} ('{}')", i + 1, ch.label);
            if ch.instrument.is_empty() || ch.parameter.is_empty() {
                return Err(invalid(format!("{which} has no instrument parameter")));
            }
            if !(ch.start.is_finite() && ch.stop.is_finite()) {
                return Err(invalid(format!("{which} has a non-finite range")));
            }
            if ch.start != ch.stop && !(ch.step.is_finite() && ch.step != 0.0) {
                return Err(invalid(format!("{which} needs a non-zero step")));
            }
            if !(ch.gain.is_finite() && ch.gain != 0.0) {
                return Err(invalid(format!("{which} needs a non-zero gain")));
            }
            if let Some(step) = ch.ramp_step {
                if !(step.is_finite() && step > 0.0) {
                    return Err(invalid(format!("{which} ramp step must be positive")));
                }
            }
        }

        for (i, ch) in self.inputs.iter().enumerate().filter(|(_, ch)| ch.active) {
            let which = format!("input {} ('{}')", i + 1, ch.label);
            if ch.instrument.is_empty() || ch.parameter.is_empty() {
                return Err(invalid(format!("{which} has no instrument parameter")));
            }
            if !(ch.gain.is_finite() && ch.gain != 0.0) {
                return Err(invalid(format!("{which} needs a non-zero gain")));
            }
        }

        Ok(())
    }

    /// Save as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from JSON. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

fn invalid(message: String) -> DaqError {
    DaqError::InvalidSettings(message)
}
