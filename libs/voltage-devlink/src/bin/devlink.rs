//! devlink - operator tool for the device link layer
//!
//! Validates configuration, probes and polls devices, and runs a simple
//! scheduling loop that combines the retry scheduler with device polling.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use voltage_devlink::{
    init_logging, ConnectionManager, DevLinkConfig, DeviceConfig, RetryScheduler,
};

#[derive(Parser)]
#[command(name = "devlink")]
#[command(about = "Device link operator tool for VoltageEMS")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML or TOML)
    #[arg(
        short,
        long,
        global = true,
        env = "DEVLINK_CONFIG",
        default_value = "config/devlink.yaml"
    )]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print a summary
    Check,

    /// Dial a device once and report latency
    Probe {
        /// Device id
        id: String,
    },

    /// Poll devices once and print the values as JSON
    Poll {
        /// Only poll this device
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Run the polling loop with retry scheduling
    Run {
        /// Stop after this many cycles (runs until Ctrl-C when absent)
        #[arg(long)]
        cycles: Option<u64>,

        /// Seconds between cycles
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DevLinkConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    let _guard = init_logging(&config.logging)?;

    match cli.command {
        Commands::Check => check(&config),
        Commands::Probe { id } => probe(&config, &id).await,
        Commands::Poll { device } => poll(&config, device.as_deref()).await,
        Commands::Run {
            cycles,
            interval_secs,
        } => run(&config, cycles, Duration::from_secs(interval_secs)).await,
    }
}

fn check(config: &DevLinkConfig) -> Result<()> {
    println!(
        "OK: {} device(s), pool capacity {}",
        config.devices.len(),
        config.pool.max_connections
    );
    for device in &config.devices {
        println!(
            "  {:<20} {:<4} {:<24} unit {:<3} {} register(s)",
            device.id(),
            device.connection.transport.protocol(),
            device.connection.transport.to_string(),
            device.connection.unit_id,
            device.registers.len()
        );
    }
    Ok(())
}

fn build_manager(config: &DevLinkConfig) -> Result<Arc<ConnectionManager>> {
    let manager = ConnectionManager::new(config.pool.clone())?;
    for device in &config.devices {
        manager.try_add_connection(device.connection.clone())?;
    }
    Ok(Arc::new(manager))
}

fn find_device<'a>(config: &'a DevLinkConfig, id: &str) -> Result<&'a DeviceConfig> {
    match config.device(id) {
        Some(device) => Ok(device),
        None => bail!("unknown device: {id}"),
    }
}

async fn probe(config: &DevLinkConfig, id: &str) -> Result<()> {
    find_device(config, id)?;
    let manager = build_manager(config)?;

    let result = manager.test_connection(id).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    manager.disconnect(id).await?;

    if !result.success {
        bail!("probe of {id} failed");
    }
    Ok(())
}

async fn poll(config: &DevLinkConfig, only: Option<&str>) -> Result<()> {
    let manager = build_manager(config)?;

    let jobs: Vec<(String, Vec<_>)> = match only {
        Some(id) => {
            let device = find_device(config, id)?;
            vec![(device.id().to_string(), device.registers.clone())]
        },
        None => config
            .devices
            .iter()
            .map(|d| (d.id().to_string(), d.registers.clone()))
            .collect(),
    };

    let mut output = serde_json::Map::new();
    for (id, result) in manager.poll_many(jobs).await {
        let entry = match result {
            Ok(values) => serde_json::to_value(values)?,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        output.insert(id, entry);
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    for id in manager.connection_ids() {
        manager.disconnect(&id).await?;
    }
    Ok(())
}

async fn run(config: &DevLinkConfig, cycles: Option<u64>, interval: Duration) -> Result<()> {
    let manager = build_manager(config)?;
    let mut scheduler = RetryScheduler::new();
    for device in &config.devices {
        scheduler.track(device.id(), device.retry.clone());
    }

    info!(
        "Polling {} device(s) every {}s",
        config.devices.len(),
        interval.as_secs()
    );

    let mut cycle = 0u64;
    loop {
        cycle += 1;
        run_cycle(config, &manager, &mut scheduler).await;

        if cycles.is_some_and(|limit| cycle >= limit) {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            },
        }
    }

    println!("{}", serde_json::to_string_pretty(&manager.get_status())?);
    for id in manager.connection_ids() {
        manager.disconnect(&id).await?;
    }
    Ok(())
}

async fn run_cycle(
    config: &DevLinkConfig,
    manager: &Arc<ConnectionManager>,
    scheduler: &mut RetryScheduler,
) {
    let now = Utc::now();
    let jobs: Vec<(String, Vec<_>)> = scheduler
        .eligible(now)
        .into_iter()
        .filter_map(|id| {
            config
                .device(&id)
                .map(|device| (id, device.registers.clone()))
        })
        .collect();
    if jobs.is_empty() {
        return;
    }

    let expected: std::collections::HashMap<String, usize> =
        jobs.iter().map(|(id, regs)| (id.clone(), regs.len())).collect();
    let results = manager.poll_many(jobs).await;
    let status = manager.get_status();
    let now = Utc::now();

    for (id, result) in results {
        let outcome = match result {
            Ok(values) if !values.is_empty() || expected.get(&id) == Some(&0) => {
                info!(conn = %id, "Polled {} value(s)", values.len());
                scheduler.record_success(&id, now)
            },
            Ok(_) => {
                let reason = status
                    .connections
                    .iter()
                    .find(|c| c.id == id)
                    .and_then(|c| c.last_error.clone())
                    .unwrap_or_else(|| "no register answered".to_string());
                scheduler.record_failure(&id, reason, now).map(|_| ())
            },
            Err(e) => scheduler.record_failure(&id, e.to_string(), now).map(|_| ()),
        };
        if let Err(e) = outcome {
            warn!(conn = %id, "Scheduler update failed: {}", e);
        }
    }
}
