//! Sweep vectors.
//!
//! Each active output contributes one axis. Axes nest in settings order: the
//! first active output is the outermost (slowest) loop and the last one the
//! innermost (fastest). The cartesian product is walked lazily by
//! [`SweepPoints`], so a large map never has to be materialized.
//!
//! In snake mode an axis runs backwards whenever the combined index of the
//! axes outside it is odd. Consecutive points then differ in a single axis by
//! a single step, which saves the retrace ramp at the end of every row.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SweepConfig;
use crate::error::{AppResult, DaqError};
use crate::ramp::ramp_steps;
use crate::settings::{MeasurementSettings, OutputChannel};

/// Relative tolerance for landing on the stop value.
const STOP_EPSILON: f64 = 1e-9;

/// Refuse plans larger than this many points.
pub const MAX_POINTS: usize = 100_000_000;

/// Linear range from `start` towards `stop`, including `stop` when it falls on
/// the grid. The direction comes from `start`/`stop`; only the magnitude of
/// `step` matters. `start == stop` gives a single point.
///
/// Axes longer than [`MAX_POINTS`] are refused before anything is allocated.
pub fn axis_values(start: f64, stop: f64, step: f64) -> AppResult<Vec<f64>> {
    let span = stop - start;
    let step = step.abs();
    if span == 0.0 || step == 0.0 || !step.is_finite() {
        return Ok(vec![start]);
    }

    let ratio = span.abs() / step;
    let intervals = (ratio + ratio.max(1.0) * STOP_EPSILON).floor();
    if intervals.is_nan() || intervals >= MAX_POINTS as f64 {
        return Err(DaqError::InvalidSettings(format!(
            "axis {start} -> {stop} in steps of {step} exceeds {MAX_POINTS} points"
        )));
    }
    let intervals = intervals as usize;
    let signed = step * span.signum();

    Ok((0..=intervals)
        .map(|i| {
            let value = start + signed * i as f64;
            // Snap accumulated error onto the stop value
            if i == intervals && (value - stop).abs() <= step * STOP_EPSILON * ratio.max(1.0) {
                stop
            } else {
                value
            }
        })
        .collect())
}

/// One axis of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepAxis {
    /// Position of the channel in `settings.outputs`
    pub channel: usize,
    /// Column label
    pub label: String,
    /// Instrument id
    pub instrument: String,
    /// Parameter name
    pub parameter: String,
    /// Values in sample units, in forward order
    pub values: Vec<f64>,
}

impl SweepAxis {
    fn from_channel(channel: usize, output: &OutputChannel) -> AppResult<Self> {
        let values = axis_values(output.start, output.stop, output.step).map_err(|e| match e {
            DaqError::InvalidSettings(reason) => {
                DaqError::InvalidSettings(format!("output '{}': {reason}", output.label))
            }
            other => other,
        })?;
        Ok(Self {
            channel,
            label: output.label.clone(),
            instrument: output.instrument.clone(),
            parameter: output.parameter.clone(),
            values,
        })
    }

    /// Number of points on this axis.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the axis has no points (never true for built plans).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ordered set of axes to walk.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    axes: Vec<SweepAxis>,
    snake: bool,
    total: usize,
}

/// One point of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    /// Position in execution order
    pub index: usize,
    /// Index into each axis' `values`
    pub indices: Vec<usize>,
    /// Value of each axis, sample units
    pub values: Vec<f64>,
    /// First point of a new innermost row (not set on the very first point)
    pub starts_block: bool,
}

impl SweepPlan {
    /// Build the plan for the active outputs of `settings`.
    pub fn from_settings(settings: &MeasurementSettings) -> AppResult<Self> {
        let axes = settings
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.active)
            .map(|(i, ch)| SweepAxis::from_channel(i, ch))
            .collect::<AppResult<Vec<_>>>()?;
        Self::new(axes, settings.snake)
    }

    /// Build a plan from explicit axes.
    pub fn new(axes: Vec<SweepAxis>, snake: bool) -> AppResult<Self> {
        let mut total: usize = 1;
        for axis in &axes {
            if axis.is_empty() {
                return Err(DaqError::InvalidSettings(format!(
                    "axis '{}' has no points",
                    axis.label
                )));
            }
            total = total
                .checked_mul(axis.len())
                .filter(|t| *t <= MAX_POINTS)
                .ok_or_else(|| {
                    DaqError::InvalidSettings(format!("sweep exceeds {MAX_POINTS} points"))
                })?;
        }
        Ok(Self { axes, snake, total })
    }

    /// Axes, outermost first.
    pub fn axes(&self) -> &[SweepAxis] {
        &self.axes
    }

    /// Points per axis, outermost first.
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(SweepAxis::len).collect()
    }

    /// Total number of points. A plan without axes has one point.
    pub fn total_points(&self) -> usize {
        self.total
    }

    /// Whether inner axes alternate direction.
    pub fn is_snake(&self) -> bool {
        self.snake
    }

    /// Point at execution position `index`.
    pub fn point(&self, index: usize) -> Option<SweepPoint> {
        if index >= self.total {
            return None;
        }

        let shape = self.shape();
        // Mixed-radix digits, outermost first
        let mut digits = vec![0usize; shape.len()];
        let mut rest = index;
        for (k, len) in shape.iter().enumerate().rev() {
            digits[k] = rest % len;
            rest /= len;
        }

        let mut indices = digits.clone();
        if self.snake {
            let mut outer = 0usize;
            for (k, len) in shape.iter().enumerate() {
                if outer % 2 == 1 {
                    indices[k] = len - 1 - digits[k];
                }
                outer = outer * len + digits[k];
            }
        }

        let values = self
            .axes
            .iter()
            .zip(&indices)
            .map(|(axis, &i)| axis.values[i])
            .collect();
        let inner = shape.last().copied().unwrap_or(1);

        Some(SweepPoint {
            index,
            indices,
            values,
            starts_block: index > 0 && index % inner == 0,
        })
    }

    /// Walk every point in execution order.
    pub fn points(&self) -> SweepPoints<'_> {
        SweepPoints {
            plan: self,
            next: 0,
        }
    }

    /// Expected wall time of a sweep, ramps included.
    ///
    /// Fails when a ramp between the planned values would need more than
    /// [`MAX_RAMP_STEPS`](crate::ramp::MAX_RAMP_STEPS) writes, or when the sampling time cannot be
    /// represented.
    pub fn estimate_duration(
        &self,
        settings: &MeasurementSettings,
        sweep: &SweepConfig,
    ) -> AppResult<Duration> {
        let per_point = settings
            .settle_time
            .saturating_add(settings.sampling_time()?)
            .saturating_add(sweep.point_overhead);
        let total = per_point.saturating_mul(saturating_u32(self.total));

        let mut ramp_writes = 0usize;
        let mut outer_points = 1usize;
        for axis in &self.axes {
            let Some(channel) = settings.outputs.get(axis.channel) else {
                continue;
            };
            let step = channel.ramp_step.or(sweep.default_ramp_step);
            let to_instrument = |v: f64| channel.instrument_value(v);
            let first = to_instrument(axis.values[0]);
            let last = to_instrument(axis.values[axis.len() - 1]);

            ramp_writes = ramp_writes.saturating_add(ramp_steps(sweep.safe_value, first, step)?);
            // Longest single move along the axis
            ramp_steps(first, last, step)?;
            if settings.ramp_back {
                let end = if self.snake && outer_points % 2 == 0 { first } else { last };
                ramp_writes = ramp_writes.saturating_add(ramp_steps(end, sweep.safe_value, step)?);
            }
            if !self.snake && outer_points > 1 {
                // Retrace from last back to first once per outer step
                let retrace = ramp_steps(last, first, step)?;
                ramp_writes = ramp_writes.saturating_add(retrace.saturating_mul(outer_points - 1));
            }
            outer_points = outer_points.saturating_mul(axis.len());
        }

        Ok(total.saturating_add(sweep.ramp_delay.saturating_mul(saturating_u32(ramp_writes))))
    }
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Iterator over the points of a [`SweepPlan`].
pub struct SweepPoints<'a> {
    plan: &'a SweepPlan,
    next: usize,
}

impl Iterator for SweepPoints<'_> {
    type Item = SweepPoint;

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.plan.point(self.next)?;
        self.next += 1;
        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.plan.total.saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for SweepPoints<'_> {}
