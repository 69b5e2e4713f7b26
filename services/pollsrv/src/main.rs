//! Device Polling Service (`pollsrv`)
//!
//! Polls field devices over the serial lines and the network gateways and
//! keeps their health records.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use common::{init_logging, load_config, shutdown_token, LogConfig};
use errors::{GatewayError, GatewayErrorTrait, GatewayResult};
use pollsrv::config::{AppConfig, ChangeFlags, MemoryDeviceStore};
use pollsrv::runtime::{EngineParts, PollingEngine};
use pollsrv::sink::{ChannelSink, RegisterBatch};
use pollsrv::transport::{
    NetworkBus, RtuSerialBus, SimulatedNetworkBus, SimulatedSerialBus, TcpNetworkBus,
};

#[derive(Parser, Debug)]
#[command(name = "pollsrv", version, about = "Field device polling and health management")]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "POLLSRV_CONFIG", default_value = "config/pollsrv.yaml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Poll in-memory simulated devices instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let args = Args::parse();
    let mut config: AppConfig = load_config(&args.config, "POLLSRV_")?;
    if let Some(level) = args.log_level {
        config.service.log_level = level;
    }

    let log_config = LogConfig {
        level: config.service.log_level.clone(),
        log_dir: config.service.log_dir.clone(),
        ..LogConfig::new(&config.service.name)
    };
    let _log_guard = init_logging(&log_config)?;

    config.engine.validate()?;
    let problems = config.invalid_devices();
    for problem in &problems {
        warn!("{}", problem);
    }
    info!(
        devices = config.devices.len(),
        serial_lines = config.serial_lines.len(),
        invalid = problems.len(),
        "Configuration checked"
    );

    if args.validate {
        if problems.is_empty() {
            info!("Validation completed successfully");
            return Ok(());
        }
        return Err(GatewayError::InvalidConfig {
            field: "devices".to_string(),
            reason: format!("{} invalid device entries", problems.len()),
        });
    }

    let flags = ChangeFlags::new();
    let store = Arc::new(MemoryDeviceStore::with_devices(
        config.devices.clone(),
        flags.clone(),
    ));
    let (sink, values) = ChannelSink::channel(config.engine.sink_capacity);
    let cancel = shutdown_token();
    let status_interval = Duration::from_secs(config.service.status_interval_secs);

    if args.simulate {
        info!("Simulation mode: polling in-memory devices");
        let engine = PollingEngine::new(EngineParts {
            store,
            flags,
            serial_bus: Arc::new(SimulatedSerialBus::seeded(&config.devices)),
            network_bus: Arc::new(SimulatedNetworkBus::seeded(&config.devices)),
            sink: Arc::new(sink),
            config: config.engine.clone(),
        });
        serve(engine, values, cancel, status_interval).await
    } else {
        let engine = PollingEngine::new(EngineParts {
            store,
            flags,
            serial_bus: Arc::new(RtuSerialBus::new(&config.serial_lines)),
            network_bus: Arc::new(TcpNetworkBus::new()),
            sink: Arc::new(sink),
            config: config.engine.clone(),
        });
        serve(engine, values, cancel, status_interval).await
    }
}

async fn serve<B: NetworkBus>(
    engine: PollingEngine<B>,
    values: mpsc::Receiver<RegisterBatch>,
    cancel: CancellationToken,
    status_interval: Duration,
) -> GatewayResult<()> {
    let handles = engine.spawn(cancel.clone())?;
    let drain = tokio::spawn(drain_values(values, cancel.clone()));

    if status_interval.is_zero() {
        cancel.cancelled().await;
    } else {
        let mut ticker = tokio::time::interval(status_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => log_status(&engine),
            }
        }
    }

    info!("Shutting down polling engine");
    let joined = handles.join().await;
    let closed = engine.close_connections();
    debug!("Closed {} idle connections", closed);
    if let Err(e) = drain.await {
        error!("Value drain task failed: {}", e);
    }
    if let Err(e) = &joined {
        error!(code = e.error_code(), "Polling engine stopped with error: {}", e);
    }
    joined?;
    Ok(())
}

/// Stand-in for the publish layers: log every batch
async fn drain_values(mut values: mpsc::Receiver<RegisterBatch>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            batch = values.recv() => {
                let Some(batch) = batch else { break };
                debug!(
                    device_id = %batch.device_id,
                    values = batch.values.len(),
                    "Values polled"
                );
                for value in &batch.values {
                    trace!(
                        device_id = %batch.device_id,
                        register = %value.register_id,
                        address = value.address,
                        raw = value.raw,
                        "Register value"
                    );
                }
            },
        }
    }
}

fn log_status<B: NetworkBus>(engine: &PollingEngine<B>) {
    let report = engine.get_all_device_status();
    let pool = engine.pool_stats();
    info!(
        serial = report.serial.len(),
        network = report.network.len(),
        disabled = report.disabled(),
        pool_open = pool.open,
        pool_capacity = pool.capacity,
        "Device status"
    );
    match serde_json::to_string(&report) {
        Ok(json) => debug!("Status report: {}", json),
        Err(e) => warn!("Failed to encode status report: {}", e),
    }
    for status in report.all().filter(|status| !status.health.is_enabled()) {
        warn!(
            device_id = %status.device_id,
            reason = ?status.health.disable_reason(),
            "Device disabled: {}",
            status.health.disable_detail()
        );
    }
}
