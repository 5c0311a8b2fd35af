//! Step-limited output ramps.
//!
//! Sources and magnet supplies must not jump: a move larger than the allowed
//! step is broken into equal steps with a pause between them.

use anyhow::Result;
use std::time::Duration;
use tracing::trace;

use crate::error::{AppResult, DaqError};
use crate::instrument::Instrument;

/// Relative slack when deciding whether a move needs another step.
const STEP_EPSILON: f64 = 1e-9;

/// Refuse ramps needing more writes than this.
pub const MAX_RAMP_STEPS: usize = 1_000_000;

/// Number of writes needed to move from `from` to `to`.
pub fn ramp_steps(from: f64, to: f64, max_step: Option<f64>) -> AppResult<usize> {
    if !(from.is_finite() && to.is_finite()) {
        return Err(DaqError::InvalidSettings(format!(
            "cannot ramp from {from} to {to}"
        )));
    }
    let delta = (to - from).abs();
    if delta == 0.0 {
        return Ok(0);
    }
    let Some(step) = max_step.filter(|s| *s > 0.0 && s.is_finite()) else {
        return Ok(1);
    };
    let steps = ((delta / step) - STEP_EPSILON).ceil().max(1.0);
    if steps > MAX_RAMP_STEPS as f64 {
        return Err(DaqError::InvalidSettings(format!(
            "ramp from {from} to {to} in steps of {step} needs more than {MAX_RAMP_STEPS} writes"
        )));
    }
    Ok(steps as usize)
}

/// Intermediate setpoints from `from` (excluded) to `to` (included), evenly
/// spaced so that no step exceeds `max_step`.
pub fn ramp_values(from: f64, to: f64, max_step: Option<f64>) -> AppResult<Vec<f64>> {
    let steps = ramp_steps(from, to, max_step)?;
    Ok((1..=steps)
        .map(|i| {
            if i == steps {
                to
            } else {
                from + (to - from) * (i as f64) / (steps as f64)
            }
        })
        .collect())
}

/// Ramp `instrument.parameter` from `from` to `to` in instrument units.
///
/// `delay` is waited between writes, not after the last one.
pub async fn ramp_to(
    instrument: &dyn Instrument,
    parameter: &str,
    from: f64,
    to: f64,
    max_step: Option<f64>,
    delay: Duration,
) -> Result<()> {
    let values = ramp_values(from, to, max_step)?;
    let last = values.len().saturating_sub(1);
    for (i, value) in values.into_iter().enumerate() {
        trace!(instrument = instrument.id(), parameter, value, "ramp step");
        instrument.set_f64(parameter, value).await?;
        if i < last && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MockInstrument;

    #[test]
    fn test_no_limit_is_single_jump() {
        assert_eq!(ramp_values(0.0, 5.0, None).unwrap(), vec![5.0]);
        assert!(ramp_values(2.0, 2.0, Some(0.1)).unwrap().is_empty());
    }

    #[test]
    fn test_even_steps_end_exactly_on_target() {
        let values = ramp_values(0.0, 1.0, Some(0.3)).unwrap();
        assert_eq!(values.len(), 4);
        assert_eq!(*values.last().unwrap(), 1.0);
        for pair in values.windows(2) {
            assert!((pair[1] - pair[0]).abs() <= 0.3 + 1e-12);
        }
    }

    #[test]
    fn test_exact_multiple_has_no_extra_step() {
        assert_eq!(ramp_steps(0.0, 1.0, Some(0.1)).unwrap(), 10);
        assert_eq!(ramp_steps(1.0, -1.0, Some(0.5)).unwrap(), 4);
        let down = ramp_values(1.0, -1.0, Some(0.5)).unwrap();
        assert_eq!(down, vec![0.5, 0.0, -0.5, -1.0]);
    }

    #[test]
    fn test_tiny_step_is_rejected_before_allocating() {
        assert!(matches!(
            ramp_values(0.0, 1.0, Some(1e-300)),
            Err(DaqError::InvalidSettings(_))
        ));
        assert!(ramp_steps(0.0, f64::INFINITY, Some(0.1)).is_err());
        assert_eq!(
            ramp_steps(0.0, 1.0, Some(1.0 / MAX_RAMP_STEPS as f64)).unwrap(),
            MAX_RAMP_STEPS
        );
    }

    #[tokio::test]
    async fn test_ramp_to_refuses_oversized_ramp_without_writing() {
        let dac = MockInstrument::dac("dac", 1);
        let err = ramp_to(&dac, "ch1", 0.0, 1.0, Some(1e-12), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::InvalidSettings(_))
        ));
        assert!(dac.history_of("ch1").is_empty());
    }

    #[tokio::test]
    async fn test_ramp_to_writes_every_step() {
        let dac = MockInstrument::dac("dac", 1);
        ramp_to(&dac, "ch1", 0.0, 2.0, Some(0.5), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(dac.history_of("ch1"), vec![0.5, 1.0, 1.5, 2.0]);
    }
}
