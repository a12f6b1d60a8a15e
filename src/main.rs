//! `microscan` command-line entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use serde_json::json;
use tracing::info;

use rust_microscan::config::ScopeConfig;
use rust_microscan::core::{Region, Trajectory};
use rust_microscan::hardware::mock::{MemorySink, MockDetector, MockOptics, MockStage};
use rust_microscan::hardware::ScopeHardware;
use rust_microscan::{logging, AcquisitionActor, MicroscopyOrchestrator};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Automated microscope acquisition.
#[derive(Debug, Parser)]
#[command(author, version, about = "Trajectory acquisition with per-object autofocus")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/microscan.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a full acquisition against simulated hardware and print the summary as JSON
    Simulate {
        /// Raster columns
        #[arg(long, default_value_t = 3)]
        cols: usize,
        /// Raster rows
        #[arg(long, default_value_t = 2)]
        rows: usize,
        /// Distance between raster points in micrometers
        #[arg(long, default_value_t = 500.0)]
        pitch: f64,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ScopeConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::PrintConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Simulate { cols, rows, pitch } => {
            logging::init(&config.application);
            simulate(config, cols, rows, pitch).await
        }
    }
}

async fn simulate(config: ScopeConfig, cols: usize, rows: usize, pitch: f64) -> Result<()> {
    let optics = MockOptics::new(128, 128, (0.0, 100.0));
    optics.add_specimen(Region::new(10, 12, 30, 30), 37.5).await;
    optics.add_specimen(Region::new(70, 60, 40, 24), 61.0).await;
    let detector = MockDetector::repeating(optics.detections().await);
    let sink = MemorySink::new();

    let hardware = ScopeHardware::new()
        .with_stage(MockStage::new())
        .with_focus(optics.actuator())
        .with_frames(optics.camera())
        .with_detector(Arc::new(detector))
        .with_sink(Arc::new(sink.clone()));
    let tick = Duration::from_millis(config.run.tick_interval_ms);
    let (handle, task) =
        AcquisitionActor::new(MicroscopyOrchestrator::new(hardware), tick).spawn();

    let trajectory = Trajectory::serpentine((0.0, 0.0), cols, rows, pitch, pitch)?;
    let run_id = handle.start_run(trajectory, config.run.clone()).await?;
    info!(%run_id, "Simulated run started");

    let status = handle.wait_until_finished(tick).await?;
    handle.shutdown().await?;
    task.await?;

    let captures: Vec<_> = sink
        .saved()
        .await
        .into_iter()
        .map(|c| c.metadata)
        .collect();
    let report = json!({
        "run_id": run_id,
        "state": status.state,
        "summary": status.summary,
        "captures": captures,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
