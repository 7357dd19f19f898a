//! BMS Field Service
//!
//! Polls BACnet and Modbus field devices described by a site directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bms::site::{Site, SiteLoader};
use bms_runtime::protocol::{BacnetNetConfig, ModbusProbeConfig};
use bms_runtime::{AdapterFactory, DeviceRegistry, FieldCore, SimNetwork, WireAdapterFactory};
use bms_types::Protocol;

/// BMS field device polling service
#[derive(Parser, Debug)]
#[command(name = "bms")]
#[command(about = "BACnet and Modbus polling service", long_about = None)]
struct Args {
    /// Path to the site directory
    #[arg(short, long, global = true, default_value = "./site")]
    site: PathBuf,

    /// Use the in-memory simulator instead of the network
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every configured device until interrupted
    Run {
        /// Seconds between health summaries (0 disables them)
        #[arg(long, default_value = "60")]
        health_interval: u64,
    },
    /// Look for devices on the network and print them as JSON
    Discover {
        /// Protocol to search (bacnet or modbus)
        protocol: Protocol,

        /// Collection window in milliseconds
        #[arg(long, default_value = "3000")]
        timeout_ms: u64,
    },
    /// Validate a site directory without touching the network
    Check,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bms=info,bms_runtime=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match args.command {
        Command::Run { health_interval } => {
            run(&args.site, args.simulate, Duration::from_secs(health_interval)).await
        }
        Command::Discover {
            protocol,
            timeout_ms,
        } => discover(&args.site, args.simulate, protocol, timeout_ms).await,
        Command::Check => check(&args.site).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

async fn run(site_path: &Path, simulate: bool, health_interval: Duration) -> Result<()> {
    info!("Starting BMS field service v{}", env!("CARGO_PKG_VERSION"));

    let site = SiteLoader::load(site_path)
        .await
        .with_context(|| format!("Failed to load site from {}", site_path.display()))?;
    info!("Loaded site: {} ({})", site.name(), site.id());
    for (path, reason) in &site.rejected {
        warn!("Skipped {}: {}", path.display(), reason);
    }

    let factory = build_factory(Some(&site), simulate).await?;
    let core = FieldCore::builder(factory)
        .with_settings(Arc::new(site.manifest.polling.settings()))
        .with_scheduler_config(site.manifest.polling.scheduler_config())
        .build();

    let mut points = 0;
    for entry in site.sorted_devices() {
        if let Err(e) = core.upsert_device(entry.device.clone()) {
            error!(device_id = entry.device.id, error = %e, "Failed to register device");
            continue;
        }
        for point in &entry.points {
            match core.upsert_point(point.clone()) {
                Ok(()) => points += 1,
                Err(e) => warn!(point_id = point.id, error = %e, "Failed to register point"),
            }
        }
    }

    let running = core.start();
    info!(
        "Registered {} devices and {} points, {} loops running",
        core.registry().len(),
        points,
        running
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    if health_interval.is_zero() {
        shutdown.await;
    } else {
        let mut ticker = tokio::time::interval(health_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => log_health(&core),
            }
        }
    }

    info!("Stopping device loops...");
    core.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn log_health(core: &FieldCore) {
    for report in core.health_overview() {
        info!(
            device_id = report.device_id,
            device = %report.name,
            state = %report.state,
            status = %report.health.status,
            polls = report.health.polls,
            failures = report.health.failures,
            "Device health"
        );
    }
}

/// Pick the adapter factory for the network or the simulator
async fn build_factory(site: Option<&Site>, simulate: bool) -> Result<Arc<dyn AdapterFactory>> {
    if simulate {
        let network = SimNetwork::new().with_latency(Duration::from_millis(20));
        if let Some(site) = site {
            for entry in site.sorted_devices() {
                network.seed(&entry.device, &entry.points);
            }
        }
        info!("Using simulated field network");
        return Ok(Arc::new(network));
    }

    let (bacnet, modbus) = match site {
        Some(site) => (site.bacnet_config(), site.manifest.modbus.clone()),
        None => (BacnetNetConfig::from_env(), ModbusProbeConfig::default()),
    };
    info!(
        interface = %bacnet.interface,
        port = bacnet.port,
        "Using BACnet/IP network"
    );
    let factory = WireAdapterFactory::new(bacnet, modbus);
    if let Err(e) = factory.preflight().await {
        bail!("BACnet socket unavailable: {}", e);
    }
    Ok(Arc::new(factory))
}

/// Wait for a shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discover
// ─────────────────────────────────────────────────────────────────────────────

async fn discover(site_path: &Path, simulate: bool, protocol: Protocol, timeout_ms: u64) -> Result<()> {
    // The site only contributes network settings; discovery works without one
    let site = if site_path.join("site.toml").exists() {
        Some(SiteLoader::load(site_path).await?)
    } else {
        None
    };

    let factory = build_factory(site.as_ref(), simulate).await?;
    let core = FieldCore::builder(factory).build();
    let candidates = core.discover_devices(protocol, timeout_ms).await?;
    info!("Found {} {} devices", candidates.len(), protocol);

    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Check
// ─────────────────────────────────────────────────────────────────────────────

async fn check(site_path: &Path) -> Result<()> {
    let site = SiteLoader::load(site_path)
        .await
        .with_context(|| format!("Failed to load site from {}", site_path.display()))?;

    // Registering into a scratch registry catches duplicate point addresses
    let registry = DeviceRegistry::new();
    let mut problems: Vec<String> = site
        .rejected
        .iter()
        .map(|(path, reason)| format!("{}: {}", path.display(), reason))
        .collect();
    for entry in site.sorted_devices() {
        if let Err(e) = registry.upsert(entry.device.clone()) {
            problems.push(format!("{}: {}", entry.source.display(), e));
            continue;
        }
        for point in &entry.points {
            if let Err(e) = registry.upsert_point(point.clone()) {
                problems.push(format!("{}: point {}: {}", entry.source.display(), point.id, e));
            }
        }
        if let Err(e) = registry.resolve(entry.device.id) {
            problems.push(format!("{}: {}", entry.source.display(), e));
        }
    }

    println!(
        "Site {} ({}): {} devices, {} points",
        site.name(),
        site.id(),
        site.devices.len(),
        site.point_count()
    );
    for problem in &problems {
        println!("  error: {}", problem);
    }
    if !problems.is_empty() {
        bail!("{} problems found", problems.len());
    }
    println!("OK");
    Ok(())
}
