//! Integration tests for sweep execution against virtual instruments.

use stab_daq::config::{StorageConfig, SweepConfig};
use stab_daq::error::DaqError;
use stab_daq::executor::{AbortSignal, SweepExecutor};
use stab_daq::instrument::{InstrumentRegistry, MockInstrument, ScpiInstrument};
use stab_daq::parameter::{Access, ParameterSpec, ParameterValue, ValueKind};
use stab_daq::settings::{InputChannel, MeasurementSettings, OutputChannel};
use stab_daq::state::ExperimentState;
use stab_daq::transport::MockTransport;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn storage(dir: &Path) -> StorageConfig {
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

fn value_of(instrument: &MockInstrument, name: &str) -> f64 {
    instrument
        .peek(name)
        .and_then(|v| v.as_f64())
        .unwrap_or(f64::NAN)
}

/// Meter whose reading is `10 * ch1 + ch2` of `dac`.
fn meter_following(dac: Arc<MockInstrument>) -> MockInstrument {
    MockInstrument::new("dmm")
        .with_parameter(
            ParameterSpec::new("voltage", ValueKind::Float).read_only(),
            None,
        )
        .unwrap()
        .with_reader("voltage", move || {
            ParameterValue::Float(10.0 * value_of(&dac, "ch1") + value_of(&dac, "ch2"))
        })
}

fn registry_with(instruments: Vec<Arc<MockInstrument>>) -> InstrumentRegistry {
    let mut registry = InstrumentRegistry::new();
    for instrument in instruments {
        registry.register(instrument).unwrap();
    }
    registry
}

fn quiet_settings(name: &str, dir: &Path) -> MeasurementSettings {
    let mut settings = MeasurementSettings::new(name);
    settings.directory = Some(dir.to_path_buf());
    settings.settle_time = Duration::ZERO;
    settings
}

fn data_rows(path: &PathBuf) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_snake_map_rows_and_blocks() {
    let dir = tempdir().unwrap();
    let dac = Arc::new(MockInstrument::dac("dac", 2));
    let dmm = Arc::new(meter_following(dac.clone()));
    let executor = SweepExecutor::new(
        registry_with(vec![dac.clone(), dmm]),
        storage(dir.path()),
        fast_sweep(),
    );

    let mut settings = quiet_settings("map", dir.path())
        .with_output(OutputChannel::new("outer", "dac", "ch1").sweep(0.0, 1.0, 1.0))
        .with_output(OutputChannel::new("inner", "dac", "ch2").sweep(0.0, 2.0, 1.0))
        .with_input(InputChannel::new("V", "dmm", "voltage"));
    settings.snake = true;

    let report = executor
        .execute(&settings, &AbortSignal::new(), None)
        .await
        .unwrap();
    assert_eq!(report.state, ExperimentState::Complete);
    assert_eq!(report.points_total, 6);

    let rows = data_rows(report.data_path.as_ref().unwrap());
    // Header ends with a blank line before the data
    assert_eq!(
        rows,
        vec![
            "",
            "",
            "0.0\t0.0\t0.0",
            "0.0\t1.0\t1.0",
            "0.0\t2.0\t2.0",
            "",
            "1.0\t2.0\t12.0",
            "1.0\t1.0\t11.0",
            "1.0\t0.0\t10.0",
        ]
    );

    // Only changed axes are written; ramp-back returns ch1 to zero
    assert_eq!(dac.history_of("ch1"), vec![1.0, 0.0]);
    assert_eq!(dac.history_of("ch2"), vec![1.0, 2.0, 1.0, 0.0]);
}

#[tokio::test]
async fn test_ramps_respect_channel_step() {
    let dir = tempdir().unwrap();
    let dac = Arc::new(MockInstrument::dac("dac", 1));
    let executor = SweepExecutor::new(
        registry_with(vec![dac.clone()]),
        storage(dir.path()),
        fast_sweep(),
    );
    let settings = quiet_settings("ramp", dir.path()).with_output(
        OutputChannel::new("Vg", "dac", "ch1")
            .sweep(0.5, 0.5, 0.1)
            .with_ramp_step(0.1),
    );

    let report = executor
        .execute(&settings, &AbortSignal::new(), None)
        .await
        .unwrap();
    assert!(report.is_success());

    let history = dac.history_of("ch1");
    assert_eq!(history.len(), 10);
    let mut previous = 0.0;
    for value in &history {
        assert!((value - previous).abs() <= 0.1 + 1e-9);
        previous = *value;
    }
    assert!((history[4] - 0.5).abs() < 1e-12);
    assert_eq!(history[9], 0.0);
}

#[tokio::test]
async fn test_gain_scales_setpoints() {
    let dir = tempdir().unwrap();
    let dac = Arc::new(MockInstrument::dac("dac", 1));
    let executor = SweepExecutor::new(
        registry_with(vec![dac.clone()]),
        storage(dir.path()),
        fast_sweep(),
    );
    let mut settings = quiet_settings("gain", dir.path()).with_output(
        OutputChannel::new("B", "dac", "ch1")
            .sweep(2.0, 2.0, 0.0)
            .with_gain(4.0),
    );
    settings.ramp_back = false;

    let report = executor
        .execute(&settings, &AbortSignal::new(), None)
        .await
        .unwrap();
    assert_eq!(report.state, ExperimentState::Complete);
    assert_eq!(dac.history_of("ch1"), vec![0.5]);

    let rows = data_rows(report.data_path.as_ref().unwrap());
    assert_eq!(rows.last().map(String::as_str), Some("2.0"));
}

#[tokio::test]
async fn test_failure_mid_sweep_still_ramps_back() {
    let dir = tempdir().unwrap();
    let dac = Arc::new(MockInstrument::dac("dac", 1));
    let executor = SweepExecutor::new(
        registry_with(vec![dac.clone()]),
        storage(dir.path()),
        fast_sweep(),
    );
    let settings = quiet_settings("fail", dir.path())
        .with_output(OutputChannel::new("Vg", "dac", "ch1").sweep(0.0, 1.0, 0.25));

    // 0.25 and 0.5 succeed, 0.75 fails
    dac.fail_set_after(2);
    let report = executor
        .execute(&settings, &AbortSignal::new(), None)
        .await
        .unwrap();

    assert_eq!(report.state, ExperimentState::Error);
    assert_eq!(report.points_done, 3);
    assert!(report
        .error
        .as_deref()
        .unwrap()
        .contains("simulated write failure"));
    assert!(report.ramp_back_errors.is_empty());
    assert_eq!(dac.history_of("ch1"), vec![0.25, 0.5, 0.0]);
}

#[tokio::test]
async fn test_abort_between_points() {
    let dir = tempdir().unwrap();
    let dac = Arc::new(MockInstrument::dac("dac", 1));
    let abort = AbortSignal::new();
    let reads = Arc::new(AtomicUsize::new(0));

    let trigger = abort.clone();
    let counter = reads.clone();
    let dmm = MockInstrument::new("dmm")
        .with_parameter(ParameterSpec::new("voltage", ValueKind::Float), None)
        .unwrap()
        .with_reader("voltage", move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                trigger.abort();
            }
            ParameterValue::Float(1.0)
        });

    let executor = SweepExecutor::new(
        registry_with(vec![dac.clone(), Arc::new(dmm)]),
        storage(dir.path()),
        fast_sweep(),
    );
    let settings = quiet_settings("abort", dir.path())
        .with_output(OutputChannel::new("Vg", "dac", "ch1").sweep(0.0, 1.0, 0.1))
        .with_input(InputChannel::new("V", "dmm", "voltage"));

    let report = executor.execute(&settings, &abort, None).await.unwrap();
    assert_eq!(report.state, ExperimentState::Aborted);
    assert_eq!(report.points_done, 2);
    assert_eq!(report.points_total, 11);
    assert_eq!(value_of(&dac, "ch1"), 0.0);
}

#[tokio::test]
async fn test_read_only_output_rejected_before_any_write() {
    let dir = tempdir().unwrap();
    let dac = Arc::new(MockInstrument::dac("dac", 1));
    let meter = MockInstrument::new("dmm")
        .with_parameter(
            ParameterSpec::new("voltage", ValueKind::Float).with_access(Access::Get),
            Some(ParameterValue::Float(0.0)),
        )
        .unwrap();
    let executor = SweepExecutor::new(
        registry_with(vec![dac.clone(), Arc::new(meter)]),
        storage(dir.path()),
        fast_sweep(),
    );
    let settings = quiet_settings("bad", dir.path())
        .with_output(OutputChannel::new("Vg", "dac", "ch1").sweep(0.0, 1.0, 0.5))
        .with_output(OutputChannel::new("V", "dmm", "voltage").sweep(0.0, 1.0, 0.5));

    let err = executor
        .execute(&settings, &AbortSignal::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::ParameterReadOnly(_)));
    assert!(dac.set_history().is_empty());
    // No data directory was created
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_snapshots_written_next_to_data() {
    let dir = tempdir().unwrap();
    let dac = Arc::new(MockInstrument::dac("dac", 1));
    let mut storage = storage(dir.path());
    storage.write_settings_snapshot = true;
    storage.write_parameter_snapshot = true;
    let executor = SweepExecutor::new(registry_with(vec![dac]), storage, fast_sweep());

    let settings = quiet_settings("snap", dir.path())
        .with_output(OutputChannel::new("Vg", "dac", "ch1").sweep(0.0, 0.5, 0.5));
    let report = executor
        .execute(&settings, &AbortSignal::new(), None)
        .await
        .unwrap();

    let data = report.data_path.unwrap();
    let stem = data.file_stem().unwrap().to_string_lossy().into_owned();
    let settings_file = data.with_file_name(format!("{stem}.settings.json"));
    let set_file = data.with_file_name(format!("{stem}.set"));

    let saved = MeasurementSettings::load(&settings_file).unwrap();
    assert_eq!(saved, settings);
    let set_text = std::fs::read_to_string(set_file).unwrap();
    assert!(set_text.starts_with("Instrument: dac\n"));
}

#[tokio::test]
async fn test_scpi_instruments_receive_expected_commands() {
    let dir = tempdir().unwrap();

    let source_transport = MockTransport::new().with_response("SOUR:VOLT?", "+0.000E+00");
    let source_bus = source_transport.handle();
    let mut source = ScpiInstrument::new("src", Box::new(source_transport));
    source
        .add_parameter(
            ParameterSpec::new("voltage", ValueKind::Float).with_range(-1.0, 1.0),
            Some("SOUR:VOLT?"),
            Some("SOUR:VOLT {value}"),
        )
        .unwrap();

    let meter_transport = MockTransport::new().with_response("MEAS:VOLT?", "+3.000E+00");
    let meter_bus = meter_transport.handle();
    let mut meter = ScpiInstrument::new("dmm", Box::new(meter_transport));
    meter
        .add_parameter(
            ParameterSpec::new("voltage", ValueKind::Float).read_only(),
            Some("MEAS:VOLT?"),
            None,
        )
        .unwrap();

    let mut registry = InstrumentRegistry::new();
    registry.register(Arc::new(source)).unwrap();
    registry.register(Arc::new(meter)).unwrap();
    registry.connect_all().await.unwrap();

    let executor = SweepExecutor::new(registry.clone(), storage(dir.path()), fast_sweep());
    let settings = quiet_settings("scpi", dir.path())
        .with_output(OutputChannel::new("V", "src", "voltage").sweep(0.0, 0.2, 0.1))
        .with_input(InputChannel::new("M", "dmm", "voltage").with_gain(2.0));

    let report = executor
        .execute(&settings, &AbortSignal::new(), None)
        .await
        .unwrap();
    assert!(report.is_success());

    assert_eq!(
        source_bus.writes(),
        vec!["SOUR:VOLT?", "SOUR:VOLT 0.1", "SOUR:VOLT 0.2", "SOUR:VOLT 0"]
    );
    assert_eq!(meter_bus.writes().len(), 3);

    let rows = data_rows(report.data_path.as_ref().unwrap());
    assert_eq!(&rows[2..], &["0.0\t1.5", "0.1\t1.5", "0.2\t1.5"]);

    registry.disconnect_all().await.unwrap();
}
