//! CLI entry point for stab_daq
//!
//! ```bash
//! stab_daq new demos/gate_sweep.json
//! stab_daq check demos/gate_sweep.json
//! stab_daq run demos/gate_sweep.json demos/stability_map.json
//! stab_daq instruments
//! stab_daq get dmm voltage
//! stab_daq set dac ch1 0.25
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use humantime_serde::re::humantime::format_duration;
use stab_daq::config::{LabConfig, DEFAULT_CONFIG_PATH};
use stab_daq::logging;
use stab_daq::parameter::{Access, ParameterValue};
use stab_daq::{InstrumentRegistry, MeasurementSettings, QueueHandle, QueueRunner, SweepExecutor};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "stab_daq")]
#[command(about = "Sequential sweep measurements for SCPI lab instruments", long_about = None)]
struct Cli {
    /// Lab configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default settings file
    New {
        /// Where to write the JSON settings
        path: PathBuf,
    },
    /// Validate settings and print the point count and duration estimate
    Check {
        settings: PathBuf,
    },
    /// Queue settings files and execute them one after another
    Run {
        #[arg(required = true)]
        settings: Vec<PathBuf>,
    },
    /// List configured instruments and their parameters
    Instruments,
    /// Read one parameter
    Get {
        instrument: String,
        parameter: String,
    },
    /// Write one parameter
    Set {
        instrument: String,
        parameter: String,
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(config = %cli.config.display(), "Configuration loaded");

    match cli.command {
        Commands::New { path } => new_settings(path),
        Commands::Check { settings } => check(&config, settings),
        Commands::Run { settings } => run(&config, settings).await,
        Commands::Instruments => list_instruments(&config).await,
        Commands::Get {
            instrument,
            parameter,
        } => get_parameter(&config, &instrument, &parameter).await,
        Commands::Set {
            instrument,
            parameter,
            value,
        } => set_parameter(&config, &instrument, &parameter, value).await,
    }
}

fn new_settings(path: PathBuf) -> Result<()> {
    let name = path
        .file_stem()
        .map_or_else(|| "measurement".to_string(), |s| s.to_string_lossy().into_owned());
    MeasurementSettings::new(name).save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn check(config: &LabConfig, path: PathBuf) -> Result<()> {
    let settings = MeasurementSettings::load(&path)?;
    let executor = SweepExecutor::from_config(InstrumentRegistry::new(), config);
    let plan = executor.plan(&settings)?;
    let estimate = executor.estimate(&settings)?;

    println!("{}: valid", settings.name);
    for axis in plan.axes() {
        println!(
            "  {} ({}.{}): {} points",
            axis.label,
            axis.instrument,
            axis.parameter,
            axis.len()
        );
    }
    println!("  total points: {}", plan.total_points());
    println!("  estimated:    {}", humantime_duration(estimate));
    Ok(())
}

async fn run(config: &LabConfig, paths: Vec<PathBuf>) -> Result<()> {
    let queued = paths
        .iter()
        .map(|path| {
            MeasurementSettings::load(path).with_context(|| format!("loading {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let registry = InstrumentRegistry::from_config(config)?;
    let executor = SweepExecutor::from_config(registry.clone(), config);
    // Nothing may start before every file is known to be runnable
    for (path, settings) in paths.iter().zip(&queued) {
        executor
            .preflight(settings)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
    }
    registry.connect_all().await?;

    let (handle, runner) = QueueRunner::spawn(executor, config.queue.max_entries);
    let mut reports = handle.subscribe();

    let printer = tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            let path = report
                .data_path
                .as_ref()
                .map_or_else(|| "-".to_string(), |p| p.display().to_string());
            println!(
                "{}: {} ({}/{} points) {}",
                report.name, report.state, report.points_done, report.points_total, path
            );
            if let Some(error) = &report.error {
                println!("  error: {error}");
            }
            for error in &report.ramp_back_errors {
                println!("  ramp-back failed: {error}");
            }
        }
    });

    let outcome = drain(&handle, queued).await;
    // Shutdown always runs so a running sweep ramps back before exit
    handle.shutdown().await?;
    runner.await?;
    drop(handle);
    // Printer ends once every report sender is gone
    printer.await?;

    registry.disconnect_all().await?;
    outcome
}

/// Enqueue `queued` and wait until the runner is idle or Ctrl-C.
async fn drain(handle: &QueueHandle, queued: Vec<MeasurementSettings>) -> Result<()> {
    for settings in queued {
        let name = settings.name.clone();
        let id = handle.enqueue(settings).await?;
        println!("Queued #{id}: {name}");
    }
    let snapshot = handle.list().await?;
    println!(
        "Expected to finish in {}",
        humantime_duration(snapshot.total_remaining)
    );

    tokio::select! {
        result = handle.wait_idle() => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, aborting and ramping back");
        }
    }
    Ok(())
}

async fn list_instruments(config: &LabConfig) -> Result<()> {
    let registry = InstrumentRegistry::from_config(config)?;
    for instrument in registry.iter() {
        println!("{} [{}]", instrument.id(), instrument.driver());
        for spec in instrument.parameter_specs().await {
            let access = match spec.access {
                Access::Get => "get",
                Access::Set => "set",
                Access::GetSet => "get/set",
            };
            println!(
                "  {:<16} {:<6} {:<8} {}",
                spec.name,
                spec.kind.to_string(),
                access,
                spec.unit.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

async fn get_parameter(config: &LabConfig, instrument: &str, parameter: &str) -> Result<()> {
    let registry = InstrumentRegistry::from_config(config)?;
    let device = registry.get(instrument)?;
    device.connect().await?;
    let result = device.get(parameter).await;
    device.disconnect().await?;
    println!("{instrument}.{parameter} = {}", result?);
    Ok(())
}

async fn set_parameter(
    config: &LabConfig,
    instrument: &str,
    parameter: &str,
    value: String,
) -> Result<()> {
    let registry = InstrumentRegistry::from_config(config)?;
    let device = registry.get(instrument)?;
    device.connect().await?;
    let result = device.set(parameter, ParameterValue::Text(value)).await;
    device.disconnect().await?;
    result?;
    if let Some(value) = device.cached(parameter).await {
        println!("{instrument}.{parameter} = {value}");
    }
    Ok(())
}

fn humantime_duration(duration: Duration) -> String {
    // Whole seconds
    format_duration(Duration::from_secs(duration.as_secs())).to_string()
}
