//! Sweep executor.
//!
//! Runs one [`MeasurementSettings`] from start to finish:
//!
//! ```text
//! validate ─> resolve instruments ─> open data file ─> ramp to first point
//!     ─> for each point { move changed axes, settle, sample, write row }
//!     ─> ramp back to the safe value
//! ```
//!
//! Everything up to and including opening the data file happens before any
//! instrument is written; failures there come back as `Err`. Once hardware
//! has been touched the executor always returns a [`SweepReport`], and the
//! ramp-back runs no matter how the loop ended.

use anyhow::Context;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument as _;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{LabConfig, StorageConfig, SweepConfig};
use crate::datafile::{self, DataFile};
use crate::error::{AppResult, DaqError};
use crate::instrument::{Instrument, InstrumentRegistry};
use crate::ramp::ramp_to;
use crate::settings::{InputChannel, MeasurementSettings, OutputChannel};
use crate::state::ExperimentState;
use crate::sweep::SweepPlan;

/// Cooperative stop flag, checked between points.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// New, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before the next run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Live progress of a running sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepProgress {
    /// Run identifier, nil before the first run
    pub run_id: Uuid,
    /// Measurement name
    pub name: String,
    /// Current state
    pub state: ExperimentState,
    /// Rows written so far
    pub points_done: usize,
    /// Rows planned
    pub points_total: usize,
}

impl Default for SweepProgress {
    fn default() -> Self {
        Self {
            run_id: Uuid::nil(),
            name: String::new(),
            state: ExperimentState::Idle,
            points_done: 0,
            points_total: 0,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Measurement name from the settings
    pub name: String,
    /// `Complete`, `Aborted` or `Error`
    pub state: ExperimentState,
    /// Rows written
    pub points_done: usize,
    /// Rows planned
    pub points_total: usize,
    /// The `.dat` file
    pub data_path: Option<PathBuf>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    /// What stopped the loop, if it did not complete
    pub error: Option<String>,
    /// Failures while returning outputs to the safe value
    pub ramp_back_errors: Vec<String>,
}

impl SweepReport {
    /// Report for settings that were rejected before any hardware was touched.
    pub fn rejected(settings: &MeasurementSettings, error: &DaqError) -> Self {
        Self::failed(settings, error.to_string())
    }

    /// `Error` report with no measured points.
    pub fn failed(settings: &MeasurementSettings, error: String) -> Self {
        let now = Local::now();
        Self {
            run_id: Uuid::new_v4(),
            name: settings.name.clone(),
            state: ExperimentState::Error,
            points_done: 0,
            points_total: 0,
            data_path: None,
            started_at: now,
            finished_at: now,
            error: Some(error),
            ramp_back_errors: Vec::new(),
        }
    }

    /// Completed with no ramp-back trouble.
    pub fn is_success(&self) -> bool {
        self.state == ExperimentState::Complete && self.ramp_back_errors.is_empty()
    }
}

/// An active output bound to its instrument.
struct ResolvedOutput {
    channel: OutputChannel,
    instrument: Arc<dyn Instrument>,
    ramp_step: Option<f64>,
    applied: Option<f64>,
}

/// An active input bound to its instrument.
struct ResolvedInput {
    channel: InputChannel,
    instrument: Arc<dyn Instrument>,
}

/// Executes measurement settings against the registered instruments.
#[derive(Clone)]
pub struct SweepExecutor {
    registry: InstrumentRegistry,
    storage: StorageConfig,
    sweep: SweepConfig,
}

impl SweepExecutor {
    pub fn new(registry: InstrumentRegistry, storage: StorageConfig, sweep: SweepConfig) -> Self {
        Self {
            registry,
            storage,
            sweep,
        }
    }

    /// Executor using the storage and sweep sections of `config`.
    pub fn from_config(registry: InstrumentRegistry, config: &LabConfig) -> Self {
        Self::new(registry, config.storage.clone(), config.sweep.clone())
    }

    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    pub fn sweep_config(&self) -> &SweepConfig {
        &self.sweep
    }

    /// Validate `settings` and build its point plan.
    pub fn plan(&self, settings: &MeasurementSettings) -> AppResult<SweepPlan> {
        self.checked_plan(settings).map(|(plan, _)| plan)
    }

    /// Expected wall time of `settings`.
    pub fn estimate(&self, settings: &MeasurementSettings) -> AppResult<Duration> {
        self.checked_plan(settings).map(|(_, estimate)| estimate)
    }

    /// Plan and estimate. The estimate also refuses ramps and sample timing
    /// that cannot be carried out.
    fn checked_plan(&self, settings: &MeasurementSettings) -> AppResult<(SweepPlan, Duration)> {
        settings.validate()?;
        let plan = SweepPlan::from_settings(settings)?;
        let estimate = plan.estimate_duration(settings, &self.sweep)?;
        Ok((plan, estimate))
    }

    /// Every check `execute` makes before touching hardware, without running
    /// anything. Returns the duration estimate.
    pub async fn preflight(&self, settings: &MeasurementSettings) -> AppResult<Duration> {
        let estimate = self.estimate(settings)?;
        self.resolve_outputs(settings).await?;
        self.resolve_inputs(settings).await?;
        Ok(estimate)
    }

    /// Ramp back the outputs of a sweep that ended without a report of its
    /// own, e.g. because its task panicked.
    pub async fn recover(&self, settings: &MeasurementSettings, reason: String) -> SweepReport {
        let mut report = SweepReport::failed(settings, reason);
        if settings.ramp_back {
            match self.resolve_outputs(settings).await {
                Ok(outputs) => report.ramp_back_errors = self.ramp_back(&outputs).await,
                Err(e) => report.ramp_back_errors.push(e.to_string()),
            }
        }
        report.finished_at = Local::now();
        report
    }

    /// Run one sweep to completion, abort or failure.
    pub async fn execute(
        &self,
        settings: &MeasurementSettings,
        abort: &AbortSignal,
        progress: Option<&watch::Sender<SweepProgress>>,
    ) -> AppResult<SweepReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sweep", run = %run_id, name = %settings.name);
        self.execute_inner(run_id, settings, abort, progress)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        run_id: Uuid,
        settings: &MeasurementSettings,
        abort: &AbortSignal,
        progress: Option<&watch::Sender<SweepProgress>>,
    ) -> AppResult<SweepReport> {
        let plan = self.plan(settings)?;
        let mut outputs = self.resolve_outputs(settings).await?;
        let inputs = self.resolve_inputs(settings).await?;

        let started_at = Local::now();
        let root = settings
            .directory
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.clone());
        let columns = datafile::columns_for(settings);
        let mut file = DataFile::create(&root, settings, &columns, &started_at)?;
        if self.storage.write_settings_snapshot {
            datafile::write_settings_snapshot(file.path(), settings)?;
        }
        if self.storage.write_parameter_snapshot {
            let snapshot = self.registry.snapshot().await;
            datafile::write_parameter_snapshot(file.path(), &snapshot)?;
        }

        let mut status = SweepProgress {
            run_id,
            name: settings.name.clone(),
            state: ExperimentState::Running,
            points_done: 0,
            points_total: plan.total_points(),
        };
        publish(progress, &status);
        info!(
            points = plan.total_points(),
            outputs = outputs.len(),
            inputs = inputs.len(),
            path = %file.path().display(),
            "Sweep started"
        );

        let outcome = self
            .run_points(
                &plan,
                settings,
                &mut outputs,
                &inputs,
                &mut file,
                abort,
                progress,
                &mut status,
            )
            .await;

        let points_done = file.rows();
        let closed = file.finish();
        if let Err(e) = &closed {
            error!(error = %e, "Failed to close data file");
        }
        let (state, error_text) = final_state(&outcome, closed.as_ref().err());
        match (state, &error_text) {
            (ExperimentState::Aborted, _) => info!(points_done, "Sweep aborted"),
            (ExperimentState::Error, Some(text)) => {
                error!(points_done, error = %text, "Sweep failed");
            }
            _ => {}
        }
        let data_path = closed.ok();

        let ramp_back_errors = if settings.ramp_back {
            self.ramp_back(&outputs).await
        } else {
            debug!("Ramp-back disabled");
            Vec::new()
        };

        status.state = state;
        status.points_done = points_done;
        publish(progress, &status);

        let report = SweepReport {
            run_id,
            name: settings.name.clone(),
            state,
            points_done,
            points_total: plan.total_points(),
            data_path,
            started_at,
            finished_at: Local::now(),
            error: error_text,
            ramp_back_errors,
        };
        info!(state = %report.state, points_done, "Sweep finished");
        Ok(report)
    }

    async fn resolve_outputs(
        &self,
        settings: &MeasurementSettings,
    ) -> AppResult<Vec<ResolvedOutput>> {
        let mut resolved = Vec::new();
        for channel in settings.active_outputs() {
            let instrument = self.registry.get(&channel.instrument)?;
            let spec = instrument
                .spec(&channel.parameter)
                .await
                .map_err(|_| unknown_parameter(&channel.instrument, &channel.parameter))?;
            if !spec.access.can_set() {
                return Err(DaqError::ParameterReadOnly(format!(
                    "{}.{}",
                    channel.instrument, channel.parameter
                )));
            }
            resolved.push(ResolvedOutput {
                ramp_step: channel
                    .ramp_step
                    .or(spec.max_step)
                    .or(self.sweep.default_ramp_step),
                channel: channel.clone(),
                instrument,
                applied: None,
            });
        }
        Ok(resolved)
    }

    async fn resolve_inputs(&self, settings: &MeasurementSettings) -> AppResult<Vec<ResolvedInput>> {
        let mut resolved = Vec::new();
        for channel in settings.active_inputs() {
            let instrument = self.registry.get(&channel.instrument)?;
            let spec = instrument
                .spec(&channel.parameter)
                .await
                .map_err(|_| unknown_parameter(&channel.instrument, &channel.parameter))?;
            if !spec.access.can_get() {
                return Err(DaqError::ParameterWriteOnly(format!(
                    "{}.{}",
                    channel.instrument, channel.parameter
                )));
            }
            resolved.push(ResolvedInput {
                channel: channel.clone(),
                instrument,
            });
        }
        Ok(resolved)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_points(
        &self,
        plan: &SweepPlan,
        settings: &MeasurementSettings,
        outputs: &mut [ResolvedOutput],
        inputs: &[ResolvedInput],
        file: &mut DataFile,
        abort: &AbortSignal,
        progress: Option<&watch::Sender<SweepProgress>>,
        status: &mut SweepProgress,
    ) -> anyhow::Result<()> {
        for point in plan.points() {
            if abort.is_aborted() {
                return Err(DaqError::Aborted.into());
            }
            if point.starts_block {
                file.new_block()?;
            }

            for (output, &target) in outputs.iter_mut().zip(&point.values) {
                if output.applied == Some(target) {
                    continue;
                }
                self.move_output(output, target).await?;
            }

            if !settings.settle_time.is_zero() {
                tokio::time::sleep(settings.settle_time).await;
            }

            let samples = sample_inputs(inputs, settings).await?;
            let mut row = point.values.clone();
            row.extend(samples);
            file.write_row(&row)?;

            status.points_done = point.index + 1;
            publish(progress, status);
            debug!(point = point.index, values = ?point.values, "Point measured");
        }
        Ok(())
    }

    /// Ramp one output to `target` (sample units).
    async fn move_output(&self, output: &mut ResolvedOutput, target: f64) -> anyhow::Result<()> {
        let channel = &output.channel;
        let to = channel.instrument_value(target);
        let from = current_value(output.instrument.as_ref(), &channel.parameter).await;
        match from {
            Some(from) => {
                ramp_to(
                    output.instrument.as_ref(),
                    &channel.parameter,
                    from,
                    to,
                    output.ramp_step,
                    self.sweep.ramp_delay,
                )
                .await
            }
            None => output.instrument.set_f64(&channel.parameter, to).await,
        }
        .with_context(|| format!("setting {}.{} to {to}", channel.instrument, channel.parameter))?;
        output.applied = Some(target);
        Ok(())
    }

    /// Ramp every output to the safe value, collecting failures.
    async fn ramp_back(&self, outputs: &[ResolvedOutput]) -> Vec<String> {
        let mut errors = Vec::new();
        let safe = self.sweep.safe_value;
        // Innermost first
        for output in outputs.iter().rev() {
            let channel = &output.channel;
            let instrument = output.instrument.as_ref();
            let result = match current_value(instrument, &channel.parameter).await {
                Some(from) => {
                    ramp_to(
                        instrument,
                        &channel.parameter,
                        from,
                        safe,
                        output.ramp_step,
                        self.sweep.ramp_delay,
                    )
                    .await
                }
                None => instrument.set_f64(&channel.parameter, safe).await,
            };
            match result {
                Ok(()) => info!(
                    instrument = %channel.instrument,
                    parameter = %channel.parameter,
                    value = safe,
                    "Ramped back"
                ),
                Err(e) => {
                    let text = format!("{}.{}: {e:#}", channel.instrument, channel.parameter);
                    error!(error = %text, "Ramp-back failed");
                    errors.push(text);
                }
            }
        }
        errors
    }
}

/// Read every input `samples_per_point` times and average, in sample units.
async fn sample_inputs(
    inputs: &[ResolvedInput],
    settings: &MeasurementSettings,
) -> anyhow::Result<Vec<f64>> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    let samples = settings.samples_per_point.max(1);
    let interval = if samples > 1 {
        settings.sample_interval()?
    } else {
        Duration::ZERO
    };

    let mut sums = vec![0.0; inputs.len()];
    for n in 0..samples {
        if n > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        for (sum, input) in sums.iter_mut().zip(inputs) {
            let reading = input
                .instrument
                .get_f64(&input.channel.parameter)
                .await
                .with_context(|| {
                    format!("reading {}.{}", input.channel.instrument, input.channel.parameter)
                })?;
            *sum += reading;
        }
    }
    Ok(sums
        .into_iter()
        .zip(inputs)
        .map(|(sum, input)| input.channel.sample_value(sum / f64::from(samples)))
        .collect())
}

/// Last known setpoint, asking the hardware when nothing is cached.
async fn current_value(instrument: &dyn Instrument, parameter: &str) -> Option<f64> {
    if let Some(value) = instrument.cached(parameter).await.and_then(|v| v.as_f64()) {
        return Some(value);
    }
    match instrument.get_f64(parameter).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(instrument = instrument.id(), parameter, error = %e, "Current value unknown, jumping");
            None
        }
    }
}

fn unknown_parameter(instrument: &str, parameter: &str) -> DaqError {
    DaqError::UnknownParameter {
        instrument: instrument.to_string(),
        parameter: parameter.to_string(),
    }
}

/// Final state and error text from the point loop and the data file close.
/// A file that failed to close turns any other outcome into `Error`.
fn final_state(
    outcome: &anyhow::Result<()>,
    close_error: Option<&DaqError>,
) -> (ExperimentState, Option<String>) {
    let aborted = outcome.as_ref().err().is_some_and(|e| is_abort(e));
    match (outcome, close_error) {
        (Ok(()), None) => (ExperimentState::Complete, None),
        (Err(e), _) if !aborted => (ExperimentState::Error, Some(format!("{e:#}"))),
        (_, Some(close)) => (
            ExperimentState::Error,
            Some(format!("data file not saved: {close}")),
        ),
        (Err(_), None) => (ExperimentState::Aborted, None),
    }
}

fn is_abort(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<DaqError>(), Some(DaqError::Aborted))
}

fn publish(progress: Option<&watch::Sender<SweepProgress>>, status: &SweepProgress) {
    if let Some(tx) = progress {
        tx.send_replace(status.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MockInstrument;
    use crate::parameter::{ParameterSpec, ParameterValue, ValueKind};
    use tempfile::tempdir;

    fn storage(dir: &std::path::Path) -> StorageConfig {
        StorageConfig {
            data_dir: dir.to_path_buf(),
            write_settings_snapshot: false,
            write_parameter_snapshot: false,
        }
    }

    fn fast_sweep() -> SweepConfig {
        SweepConfig {
            point_overhead: Duration::ZERO,
            default_ramp_step: None,
            ramp_delay: Duration::ZERO,
            safe_value: 0.0,
        }
    }

    fn registry(dac: Arc<MockInstrument>, dmm: Arc<MockInstrument>) -> InstrumentRegistry {
        let mut registry = InstrumentRegistry::new();
        registry.register(dac).unwrap();
        registry.register(dmm).unwrap();
        registry
    }

    fn dmm() -> Arc<MockInstrument> {
        let dmm = MockInstrument::new("dmm")
            .with_parameter(
                ParameterSpec::new("voltage", ValueKind::Float),
                Some(ParameterValue::Float(2.0)),
            )
            .unwrap();
        Arc::new(dmm)
    }

    fn settings(dir: &std::path::Path) -> MeasurementSettings {
        let mut settings = MeasurementSettings::new("iv")
            .with_output(OutputChannel::new("Vg", "dac", "ch1").sweep(0.0, 1.0, 0.5))
            .with_input(InputChannel::new("V", "dmm", "voltage").with_gain(10.0));
        settings.directory = Some(dir.to_path_buf());
        settings.settle_time = Duration::ZERO;
        settings.samples_per_point = 1;
        settings
    }

    #[tokio::test]
    async fn test_sweep_writes_rows_and_ramps_back() {
        let dir = tempdir().unwrap();
        let dac = Arc::new(MockInstrument::dac("dac", 1));
        let executor = SweepExecutor::new(
            registry(dac.clone(), dmm()),
            storage(dir.path()),
            fast_sweep(),
        );

        let report = executor
            .execute(&settings(dir.path()), &AbortSignal::new(), None)
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.points_done, 3);
        assert_eq!(dac.history_of("ch1"), vec![0.5, 1.0, 0.0]);

        let text = std::fs::read_to_string(report.data_path.unwrap()).unwrap();
        let rows: Vec<&str> = text
            .lines()
            .filter(|l| !l.starts_with('#') && !l.is_empty())
            .collect();
        assert_eq!(rows, vec!["0.0\t0.2", "0.5\t0.2", "1.0\t0.2"]);
    }

    #[tokio::test]
    async fn test_aborted_before_first_point() {
        let dir = tempdir().unwrap();
        let dac = Arc::new(MockInstrument::dac("dac", 1));
        let executor = SweepExecutor::new(
            registry(dac.clone(), dmm()),
            storage(dir.path()),
            fast_sweep(),
        );
        let abort = AbortSignal::new();
        abort.abort();

        let report = executor
            .execute(&settings(dir.path()), &abort, None)
            .await
            .unwrap();
        assert_eq!(report.state, ExperimentState::Aborted);
        assert_eq!(report.points_done, 0);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_instrument_touches_nothing() {
        let dir = tempdir().unwrap();
        let dac = Arc::new(MockInstrument::dac("dac", 1));
        let executor = SweepExecutor::new(
            registry(dac.clone(), dmm()),
            storage(dir.path()),
            fast_sweep(),
        );
        let settings = settings(dir.path())
            .with_input(InputChannel::new("I", "lockin", "x"));

        let err = executor
            .execute(&settings, &AbortSignal::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::UnknownInstrument(id) if id == "lockin"));
        assert!(dac.set_history().is_empty());
    }

    #[test]
    fn test_unclosed_data_file_is_an_error() {
        let close = DaqError::Io(std::io::Error::other("disk full"));
        let (state, text) = final_state(&Ok(()), Some(&close));
        assert_eq!(state, ExperimentState::Error);
        assert!(text.unwrap().contains("disk full"));

        let aborted: anyhow::Result<()> = Err(DaqError::Aborted.into());
        assert_eq!(final_state(&aborted, None).0, ExperimentState::Aborted);
        assert_eq!(final_state(&aborted, Some(&close)).0, ExperimentState::Error);

        let failed: anyhow::Result<()> = Err(anyhow::anyhow!("dmm timeout"));
        let (state, text) = final_state(&failed, Some(&close));
        assert_eq!(state, ExperimentState::Error);
        assert_eq!(text.as_deref(), Some("dmm timeout"));

        assert_eq!(final_state(&Ok(()), None), (ExperimentState::Complete, None));
    }

    #[tokio::test]
    async fn test_preflight_checks_without_writing() {
        let dir = tempdir().unwrap();
        let dac = Arc::new(MockInstrument::dac("dac", 1));
        let executor = SweepExecutor::new(
            registry(dac.clone(), dmm()),
            storage(dir.path()),
            fast_sweep(),
        );

        assert!(executor.preflight(&settings(dir.path())).await.is_ok());
        let unknown = settings(dir.path()).with_input(InputChannel::new("I", "lockin", "x"));
        assert!(matches!(
            executor.preflight(&unknown).await,
            Err(DaqError::UnknownInstrument(_))
        ));
        let mut crawl = settings(dir.path());
        crawl.outputs[0].ramp_step = Some(1e-300);
        assert!(matches!(
            executor.preflight(&crawl).await,
            Err(DaqError::InvalidSettings(_))
        ));
        assert!(dac.set_history().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_recover_ramps_outputs_back() {
        let dir = tempdir().unwrap();
        let dac = Arc::new(MockInstrument::dac("dac", 1));
        dac.set_f64("ch1", 0.5).await.unwrap();
        let executor = SweepExecutor::new(
            registry(dac.clone(), dmm()),
            storage(dir.path()),
            fast_sweep(),
        );

        let report = executor
            .recover(&settings(dir.path()), "sweep task panicked".to_string())
            .await;
        assert_eq!(report.state, ExperimentState::Error);
        assert_eq!(report.error.as_deref(), Some("sweep task panicked"));
        assert!(report.ramp_back_errors.is_empty());
        assert_eq!(dac.history_of("ch1"), vec![0.5, 0.0]);
    }

    #[test]
    fn test_abort_signal_reset() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        clone.abort();
        assert!(signal.is_aborted());
        signal.reset();
        assert!(!clone.is_aborted());
    }
}
