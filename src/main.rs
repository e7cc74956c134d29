//! CLI Entry Point for beamline-align
//!
//! Provides a command-line interface for:
//! - Checking a configuration file (TOML + `BEAMLINE_ALIGN_` environment)
//! - Running the diffractometer centring procedure against simulated devices
//!
//! # Usage
//!
//! ```bash
//! beamline-align check-config config/beamline_align.toml
//! beamline-align simulate-centring --config config/beamline_align.toml --edge-at-180 1.2
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use beamline_align::config::{AlignConfig, DEFAULT_CONFIG_PATH};
use beamline_align::experiment::run_engine::RunEngine;
use beamline_align::hardware::capabilities::Movable;
use beamline_align::hardware::mock::{DiffractometerScene, SimulatedDiffractometer};
use beamline_align::hardware::registry::DeviceRegistry;
use beamline_align::procedures::centring::beam_on_centre_diffractometer;
use beamline_align::tracing_setup;

#[derive(Parser)]
#[command(name = "beamline-align")]
#[command(about = "Closed-loop beamline alignment procedures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file, then print a summary
    CheckConfig {
        /// Path to the TOML configuration
        path: PathBuf,
    },

    /// Run beam-on-rotation-centre alignment on a simulated diffractometer
    SimulateCentring {
        /// Configuration file (device, centring and logging sections are used)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Pin edge height seen at 180° in the simulated scene, in mm
        #[arg(long)]
        edge_at_180: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => check_config(path),
        Commands::SimulateCentring {
            config,
            edge_at_180,
        } => simulate_centring(config, edge_at_180).await,
    }
}

fn load_config(path: &Path) -> Result<AlignConfig> {
    let config = AlignConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;

    println!("Configuration OK: {}", path.display());
    println!("  application: {} (log level {})", config.application.name, config.application.log_level);
    println!(
        "  detector:    {}-{}",
        config.devices.detector, config.devices.detector_field
    );
    println!(
        "  centring:    acceptance {} mm, gain {}, max {} iterations",
        config.centring.mirror_diff_acceptance,
        config.centring.mirror_height_adjust,
        config.centring.max_iterations
    );
    println!(
        "  pin scan:    mirror ±{} ({} pts), stage y ±{} mm ({} pts)",
        config.centring.pin_scan.mirror_coverage / 2.0,
        config.centring.pin_scan.mirror_num,
        config.centring.pin_scan.sy_coverage / 2.0,
        config.centring.pin_scan.sy_num
    );
    println!("  settle:      poll every {} s", config.settle.poll_delay);
    Ok(())
}

async fn simulate_centring(config_path: Option<PathBuf>, edge_at_180: Option<f64>) -> Result<()> {
    let config = load_config(&config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)))?;
    tracing_setup::init_from_config(&config)?;

    let mut scene = DiffractometerScene::default();
    if let Some(edge) = edge_at_180 {
        scene.edge_at_180 = edge;
    }

    let mut registry = DeviceRegistry::new();
    let sim = SimulatedDiffractometer::build(scene, &config.devices, &mut registry)?;
    let engine = RunEngine::new(Arc::new(registry));
    info!(devices = ?engine.registry().list_devices(), "Simulated diffractometer ready");

    let report = beam_on_centre_diffractometer(&engine, &config.devices, &config.centring).await?;

    println!("Centring converged after {} correction(s)", report.iterations);
    println!("  y0   = {:.4} mm", report.y_0);
    println!("  y180 = {:.4} mm", report.y_180);
    println!("  mid  = {:.4} mm", report.middle);
    println!("  mirror height = {:.5}", sim.mirror_height.position().await?);
    Ok(())
}
