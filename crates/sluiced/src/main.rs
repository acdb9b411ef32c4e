//! sluiced — valve controller daemon.
//!
//! Builds the runtime from config and parks until ctrl-c. The platform
//! layer (radio stack, broker client, GPIO) attaches to the driver
//! endpoints; the stubs below stand in on machines without the hardware.

use std::sync::Arc;

use anyhow::Result;

use sluice_core::config::SluiceConfig;
use sluice_services::{AccessPoint, SolenoidDriver, WifiDriver};
use sluiced::runtime::Runtime;

/// Valve channels on the reference board.
const VALVE_CHANNELS: usize = 8;

/// Stand-in GPIO driver: logs transitions instead of toggling pins.
struct LoggingSolenoidDriver;

impl SolenoidDriver for LoggingSolenoidDriver {
    fn set(&self, channel: u8, open: bool) -> Result<()> {
        tracing::info!(channel, open, "solenoid gpio (stub)");
        Ok(())
    }
}

/// Stand-in Wi-Fi driver: empty scans, credentials accepted and logged.
struct LoggingWifiDriver;

impl WifiDriver for LoggingWifiDriver {
    fn scan(&self) -> Result<Vec<AccessPoint>> {
        Ok(Vec::new())
    }

    fn configure(&self, ssid: &str, _passphrase: &str) -> Result<()> {
        tracing::info!(ssid, "wifi credentials accepted (stub)");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug cargo run -p sluiced
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = SluiceConfig::write_default_if_missing()?;
    let config = SluiceConfig::load()?;
    tracing::info!(
        config = %config_path.display(),
        security1 = config.security.enabled(),
        broker = %config.broker.uri,
        "sluiced starting"
    );

    let (runtime, endpoints) = Runtime::start(
        config,
        Arc::new(LoggingWifiDriver),
        Arc::new(LoggingSolenoidDriver),
        VALVE_CHANNELS,
    )?;

    // Periodic health snapshot so an operator tailing the log sees life.
    let health_registry = runtime.registry();
    let health_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let stats = health_registry.system_stats();
            tracing::info!(
                health = ?health_registry.system_health(),
                total_errors = stats.total_errors,
                worst = ?stats.most_error_prone_component,
                "health snapshot"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("ctrl-c received");

    health_task.abort();
    runtime.shutdown().await;
    // The endpoints outlive the workers so channel closure never races
    // the shutdown broadcast.
    drop(endpoints);

    Ok(())
}
