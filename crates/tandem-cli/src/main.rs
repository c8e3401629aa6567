//! Tandem - synchronized recording across heterogeneous devices
//!
//! Connects every configured device, starts them together, waits for the
//! requested duration (or Ctrl-C), stops them together, and writes the
//! streamed samples plus a session manifest.

mod config;
mod output;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{ErrorRecord, FanOutReport, Orchestrator, StopOutcome};
use tandem_devices::DefaultClientFactory;
use tandem_discovery::{ssdp, DiscoveryCache};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(about = "Start and stop recording on cameras, EEG headsets, and phones at the same instant")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tandem.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for UPnP cameras and advertising BLE devices
    Discover,
    /// Run one synchronized recording session
    Record {
        /// Recording length in seconds (overrides the config; Ctrl-C stops early)
        #[arg(short, long)]
        duration: Option<u64>,
        /// Directory for recordings (overrides the config)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Write an example configuration file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Tandem v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::InitConfig => {
            if args.config.exists() {
                bail!("{} already exists", args.config.display());
            }
            config::save_default_config(&args.config)?;
            println!("Wrote example configuration to {}", args.config.display());
            Ok(())
        }
        Command::Discover => {
            let config = config::load_config(&args.config)?;
            discover(&config).await
        }
        Command::Record {
            duration,
            output_dir,
        } => {
            let mut config = config::load_config(&args.config)?;
            if duration.is_some() {
                config.session.duration_secs = duration;
            }
            if let Some(dir) = output_dir {
                config.session.output_dir = dir;
            }
            record(&config).await
        }
    }
}

async fn discover(config: &config::Config) -> Result<()> {
    let timeouts = config.to_client_timeouts();

    println!("UPnP cameras:");
    match ssdp::search(ssdp::SCALAR_WEB_API_ST, timeouts.upnp).await {
        Ok(locations) if locations.is_empty() => println!("  (none)"),
        Ok(locations) => {
            let http = reqwest_client(timeouts.http)?;
            for location in locations {
                match ssdp::fetch_camera_endpoint(&http, &location).await {
                    Ok(endpoint) => println!("  - {} (description {})", endpoint, location),
                    Err(e) => println!("  - {} (unreadable: {})", location, e),
                }
            }
        }
        Err(e) => warn!(error = %e, "UPnP search failed"),
    }

    println!("BLE devices:");
    let mut cache: DiscoveryCache = DiscoveryCache::new(timeouts.cache_max_age, timeouts.scan);
    match cache.refresh().await {
        Ok(()) if cache.is_empty() => println!("  (none)"),
        Ok(()) => {
            for (device, _) in cache.entries() {
                println!("  - {} [{}]", device.name, device.address);
            }
        }
        Err(e) => warn!(error = %e, "BLE scan failed"),
    }
    Ok(())
}

fn reqwest_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

fn report(report: &FanOutReport) {
    for record in &report.failed {
        warn!(
            device = %record.device,
            operation = %record.operation,
            kind = ?record.kind(),
            error = %record.error,
            "Device failed"
        );
    }
    for id in &report.skipped {
        warn!(device = %id, operation = %report.operation, "Device skipped");
    }
    info!(
        operation = %report.operation,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "Fan-out finished"
    );
}

async fn record(config: &config::Config) -> Result<()> {
    let descriptors = config.to_descriptors()?;
    if descriptors.is_empty() {
        bail!("No devices configured; run `tandem init-config` for an example");
    }

    let factory = DefaultClientFactory::new(config.to_client_timeouts())?
        .with_udp_commands(config.udp_camera.clone());
    let mut orchestrator = Orchestrator::new(Arc::new(factory), config.to_orchestrator_config());

    let connected = orchestrator.connect_all(descriptors).await;
    report(&connected);

    let started = match orchestrator.start_all().await {
        Ok(started) => started,
        Err(e) => {
            orchestrator.disconnect_all().await;
            return Err(e).context("Recording did not start");
        }
    };
    report(&started);
    if started.succeeded.is_empty() {
        orchestrator.disconnect_all().await;
        bail!("No device started recording");
    }

    match config.session.duration_secs {
        Some(secs) => {
            info!(duration_secs = secs, "Recording (Ctrl-C stops early)");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            info!("Recording until Ctrl-C");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
        }
    }

    let StopOutcome {
        session,
        report: stopped,
    } = orchestrator.stop_all().await?;
    report(&stopped);

    let failures: Vec<ErrorRecord> = [connected.failed, started.failed, stopped.failed].concat();
    let persisted = output::persist(session, &failures, &config.session.output_dir);
    orchestrator.disconnect_all().await;
    let persisted = persisted?;

    println!("Session manifest: {}", persisted.manifest.display());
    for file in &persisted.files {
        println!("Recording: {}", file.display());
    }
    if !failures.is_empty() {
        println!("{} device operation(s) failed:", failures.len());
        for record in &failures {
            println!("  - {}", record);
        }
    }
    Ok(())
}
