//! evteld - EV telemetry daemon
//!
//! Polls the selected vehicle through its OBD-II port and logs decoded
//! quantities through registered observers.
//!
//! Usage:
//!   evteld [config.toml]
//!
//! With no config file, polls a mock "Leaf ZE1" for demo purposes.

mod config;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evtel_broker::DataBroker;
use evtel_core::DataItems;
use evtel_vehicle::VehicleManager;

use config::DaemonConfig;

/// Evaluator tick, matching the cadence the decoders are tuned for.
const VEHICLE_EVAL_INTERVAL: Duration = Duration::from_millis(10);

struct Args {
    config_path: Option<String>,
}

fn parse_args() -> Args {
    let mut result = Args { config_path: None };

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            a if !a.starts_with('-') => {
                result.config_path = Some(a.to_string());
            }
            _ => {
                tracing::warn!("Unknown argument: {}", arg);
            }
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"evteld - EV telemetry daemon

Usage: evteld [config.toml]

Options:
  -h, --help    Print this help message

Examples:
  # Poll a mock vehicle
  evteld

  # Poll the configured vehicle
  evteld config.toml

Known vehicles: {}"#,
        evtel_vehicle::vehicle_names().join(", ")
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evteld=info,evtel_can=info,evtel_vehicle=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting evteld");

    let args = parse_args();
    let config = match args.config_path {
        Some(ref path) => {
            tracing::info!("Loading config from: {}", path);
            let content = std::fs::read_to_string(path)?;
            DaemonConfig::from_toml(&content)?
        }
        None => {
            tracing::info!("No config file provided, polling a mock vehicle");
            DaemonConfig::from_toml(r#"vehicle = "Leaf ZE1""#)?
        }
    };

    let broker = Arc::new(DataBroker::new());
    broker.enable_fast_average(config.fast_average);

    let mut vm = VehicleManager::new(&config.vehicle, &config.transport, broker.clone()).await?;

    // Poll everything the vehicle supports unless the config narrows it.
    let supported = vm.supported_item_mask();
    let mask = match config.item_mask {
        Some(bits) => DataItems::from_bits_truncate(bits) & supported,
        None => supported,
    };
    register_observers(&broker, mask);
    vm.set_request_item_mask(mask);

    tracing::info!(
        vehicle = %config.vehicle,
        items = format_args!("{:#x}", mask.bits()),
        "polling started"
    );

    // Vehicle evaluator loop.
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(VEHICLE_EVAL_INTERVAL);
        loop {
            tick.tick().await;
            if vm.connected() {
                vm.eval().await;
            }
        }
    });

    // Observer loop: drain the broker at its own cadence.
    let mut tick = tokio::time::interval(Duration::from_millis(config.observer_interval_ms));
    loop {
        tick.tick().await;
        broker.drain();
    }
}

/// Log every polled item as it updates; the display stack registers its
/// own callbacks the same way.
fn register_observers(broker: &DataBroker, mask: DataItems) {
    for (item, label) in DataItems::LABELED {
        if !mask.contains(item) {
            continue;
        }
        broker.register_callback(item, move |value| {
            tracing::info!(item = label, value, "telemetry");
        });
    }
}
