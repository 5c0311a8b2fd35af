//! Integration tests for the shipped configuration and demo settings.

use stab_daq::config::{LabConfig, TransportConfig};
use stab_daq::executor::SweepExecutor;
use stab_daq::instrument::InstrumentRegistry;
use stab_daq::settings::MeasurementSettings;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

fn repo_file(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative)
}

#[test]
fn test_shipped_config_loads_and_validates() {
    let config = LabConfig::load_from(repo_file("config/stabdaq.toml")).unwrap();
    config.validate().unwrap();

    assert_eq!(config.sweep.ramp_delay, Duration::from_millis(10));
    assert_eq!(config.sweep.default_ramp_step, Some(0.1));

    let smu = config
        .instruments
        .iter()
        .find(|inst| inst.id == "smu")
        .unwrap();
    assert!(!smu.enabled);
    assert!(matches!(
        smu.transport,
        Some(TransportConfig::Visa { ref resource, .. }) if resource == "GPIB0::24::INSTR"
    ));

    let scope = config
        .instruments
        .iter()
        .find(|inst| inst.id == "scope")
        .unwrap();
    assert!(matches!(scope.transport, Some(TransportConfig::Vicp { .. })));

    let enabled: Vec<&str> = config
        .enabled_instruments()
        .iter()
        .map(|inst| inst.id.as_str())
        .collect();
    assert_eq!(enabled, vec!["dac", "dmm"]);
}

#[tokio::test]
async fn test_registry_from_shipped_config() {
    let config = LabConfig::load_from(repo_file("config/stabdaq.toml")).unwrap();
    let registry = InstrumentRegistry::from_config(&config).unwrap();
    assert_eq!(registry.ids(), vec!["dac", "dmm"]);

    let dac = registry.get("dac").unwrap();
    let ch1 = dac.spec("ch1").await.unwrap();
    assert_eq!(ch1.max_step, Some(0.05));
    assert_eq!(dac.get_f64("ch1").await.unwrap(), 0.0);
}

#[test]
fn test_demo_settings_are_valid() {
    let config = LabConfig::load_from(repo_file("config/stabdaq.toml")).unwrap();
    let executor = SweepExecutor::from_config(InstrumentRegistry::new(), &config);

    let gate = MeasurementSettings::load(repo_file("demos/gate_sweep.json")).unwrap();
    assert_eq!(executor.plan(&gate).unwrap().total_points(), 21);

    let map = MeasurementSettings::load(repo_file("demos/stability_map.json")).unwrap();
    let plan = executor.plan(&map).unwrap();
    assert_eq!(plan.shape(), vec![21, 101]);
    assert!(plan.is_snake());
    assert!(executor.estimate(&map).unwrap() > Duration::from_secs(40));
}

#[test]
fn test_minimal_file_gets_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [[instruments]]
        id = "meter"
        type = "scpi"

        [instruments.transport]
        kind = "tcp"
        address = "192.168.1.20:5025"

        [[instruments.parameters]]
        name = "voltage"
        access = "get"
        get = "MEAS:VOLT?"
        "#
    )
    .unwrap();

    let config = LabConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.application.log_level, "info");
    assert_eq!(config.storage.data_dir, PathBuf::from("data"));

    match &config.instruments[0].transport {
        Some(TransportConfig::Tcp {
            timeout,
            terminator,
            delimiter,
            ..
        }) => {
            assert_eq!(*timeout, Duration::from_secs(2));
            assert_eq!(terminator, "\n");
            assert_eq!(*delimiter, '\n');
        }
        other => panic!("unexpected transport {other:?}"),
    }
}

#[test]
fn test_parse_inline_toml() {
    let toml_str = r#"
        [application]
        name = "bench"
        log_level = "debug"
        log_format = "json"

        [sweep]
        ramp_delay = "50ms"
        safe_value = -0.5

        [[instruments]]
        id = "dac"
        type = "mock"
    "#;
    let config: LabConfig = toml::from_str(toml_str).unwrap();
    config.validate().unwrap();
    assert_eq!(config.sweep.ramp_delay, Duration::from_millis(50));
    assert_eq!(config.sweep.safe_value, -0.5);
    assert_eq!(config.queue.max_entries, 64);
    assert!(config.instruments[0].enabled);
}

#[test]
fn test_environment_overrides_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[queue]\nmax_entries = 4").unwrap();

    std::env::set_var("STABDAQ_QUEUE__MAX_ENTRIES", "9");
    let config = LabConfig::load_from(file.path());
    std::env::remove_var("STABDAQ_QUEUE__MAX_ENTRIES");

    assert_eq!(config.unwrap().queue.max_entries, 9);
}

#[test]
fn test_bad_settings_file_reports_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{{ \"name\": 3 }}").unwrap();
    assert!(MeasurementSettings::load(file.path()).is_err());
}
