//! # Bender Control Unit
//!
//! Runs the motion core of one profile bender: loads `machine.toml`, opens
//! the fieldbus transport named in `[fieldbus].driver`, starts the status
//! loop and logs machine events until Ctrl+C. On shutdown every axis is
//! stopped before the connection is closed.
//!
//! `--simulate` swaps the transport for the in-memory slave, which is
//! useful for commissioning a configuration without the I/O rack.

use bend_common::config::{ConfigLoader, LogLevel, MachineConfig};
use bend_common::consts::DEFAULT_CONFIG_PATH;
use bend_common::event::MachineEvent;
use bend_control_unit::Machine;
use bend_hal::DriverRegistry;
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Bender Control Unit: axis positioning and status over Modbus-TCP
#[derive(Parser, Debug)]
#[command(name = "bend_cu")]
#[command(version)]
#[command(about = "Motion core of the hydraulic profile bender")]
struct Args {
    /// Path to the machine configuration TOML.
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated fieldbus slave instead of the configured driver.
    #[arg(long)]
    simulate: bool,

    /// Log at DEBUG level at least, whatever `[shared].log_level` says.
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    // Loaded before the subscriber exists so `[shared].log_level` applies.
    let config = MachineConfig::load(&args.config);
    let configured = config
        .as_ref()
        .map_or(LogLevel::default(), |config| config.shared.log_level);
    setup_tracing(&args, configured);

    info!("Bender Control Unit v{} starting...", env!("CARGO_PKG_VERSION"));

    let result = match config {
        Ok(config) => run(&args, config),
        Err(e) => Err(format!("cannot load {}: {e}", args.config.display()).into()),
    };
    if let Err(e) = result {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("Bender Control Unit shutdown complete");
}

fn run(args: &Args, config: MachineConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!(
        service = %config.shared.service_name,
        "Config OK: {} axes, sync period {}ms, fieldbus {}:{}",
        config.axes.len(),
        config.sync.period_ms,
        config.fieldbus.host,
        config.fieldbus.port,
    );

    let driver = if args.simulate {
        "simulation"
    } else {
        config.fieldbus.driver.as_str()
    };
    let registry = DriverRegistry::with_builtin();
    let transport = registry.create_transport(driver, &config)?;
    info!("Fieldbus driver: {driver}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(Arc::new(config), transport))
}

async fn serve(
    config: Arc<MachineConfig>,
    transport: Arc<dyn bend_common::fieldbus::FieldbusTransport>,
) -> Result<(), Box<dyn std::error::Error>> {
    let machine = Arc::new(Machine::new(config, transport));

    if let Err(e) = machine.connect().await {
        warn!("Initial connect failed: {e}. The status loop will retry.");
    }

    let mut events = machine.subscribe();
    let sync = machine.start_sync();
    info!("Status loop running");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Received shutdown signal");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => warn!("Event log lagged, {missed} events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Err(e) = machine.stop_all().await {
        error!("Stopping axes failed: {e}");
    }
    let stats = sync.stats();
    sync.shutdown().await;
    info!(
        "Status loop stopped: {} cycles, {} skipped, {} failed",
        stats.cycles, stats.skipped, stats.failed
    );
    machine.disconnect().await?;
    Ok(())
}

fn log_event(event: &MachineEvent) {
    match event {
        MachineEvent::StatusRefreshed { .. } => {}
        MachineEvent::SafetyViolation(flags) => error!("Safety violation: {flags}"),
        MachineEvent::AlarmRaised(flags) => warn!("Alarm raised: {flags}"),
        MachineEvent::SyncFault { message } => warn!("Status poll failed: {message}"),
        other => match serde_json::to_string(other) {
            Ok(json) => debug!(event = %json, "machine event"),
            Err(e) => warn!("Unserializable event: {e}"),
        },
    }
}

/// Setup tracing subscriber from the configured level and CLI arguments.
///
/// `RUST_LOG`, when set, replaces the level entirely.
fn setup_tracing(args: &Args, configured: LogLevel) {
    let level = effective_level(configured, args.verbose);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

/// `--verbose` raises the configured level to DEBUG, never lowers it.
fn effective_level(configured: LogLevel, verbose: bool) -> LogLevel {
    match configured {
        LogLevel::Trace => LogLevel::Trace,
        _ if verbose => LogLevel::Debug,
        level => level,
    }
}
