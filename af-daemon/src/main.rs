//! Aeroflux daemon (aerofluxd)
//!
//! Reads temperatures, evaluates the configured speed curves and drives the
//! PWM outputs so thermal targets are met without fans stalling or
//! oscillating. One task runs per sensor (polling) and one per fan (control
//! loop); a failing fan loop restores its hardware and exits without taking
//! the others down.

mod controller;
mod monitor;
mod shutdown;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use af_core::config::{self, validation};
use af_core::{Persistence, Registry};
use controller::{ControllerSettings, FanController};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Aeroflux fan control daemon
#[derive(Parser, Debug)]
#[command(name = "aerofluxd")]
#[command(version, about = "Aeroflux fan control daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = config::default_config_path())]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    info!("STARTUP: aerofluxd {} starting", VERSION);
    info!("STARTUP: Configuration file: {}", args.config.display());

    // configuration problems are fatal before any fan is touched
    let config = match config::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = validation::validate_config(&config) {
        error!("Configuration invalid: {e}");
        std::process::exit(1);
    }
    info!(
        fans = config.fans.len(),
        curves = config.curves.len(),
        sensors = config.sensors.len(),
        "STARTUP: Configuration validated"
    );

    let registry = match Registry::from_config(&config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to resolve configured devices: {e}");
            std::process::exit(1);
        }
    };
    let persistence = Arc::new(Persistence::new(&config.db_path));
    let settings = ControllerSettings::from_config(&config);

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let mut handles = Vec::new();

    for sensor in registry.sensors.values() {
        handles.push(tokio::spawn(monitor::run_sensor_monitor(
            sensor.clone(),
            config.temp_sensor_polling_rate(),
            shutdown_rx.clone(),
        )));
    }

    for fan in registry.fans.values() {
        let fan_controller = FanController::new(
            fan.clone(),
            registry.clone(),
            persistence.clone(),
            settings.clone(),
        );
        let fan_id = fan.id().to_string();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = fan_controller.run(rx).await {
                error!(fan = %fan_id, error = %e, "Fan controller terminated");
            }
        }));
    }
    drop(shutdown_rx);

    info!(
        "STARTUP: {} sensor monitors and {} fan controllers running",
        registry.sensors.len(),
        registry.fans.len()
    );

    shutdown::wait_for_signal().await;

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    info!("SHUTDOWN: Daemon terminated gracefully");
    Ok(())
}

/// Initialize logging: journald when the systemd journal is reachable,
/// stdout otherwise. `AEROFLUX_LOG` overrides the level filter.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        std::env::var("AEROFLUX_LOG").unwrap_or_else(|_| default_level.to_string());

    if Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(EnvFilter::new(&filter))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {e}, falling back to stdout");
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::new(&filter))
        .init();
}
