//! Connector simulator.
//!
//! Runs the configured channels against an in-memory broker that stays
//! unreachable for `--outage-secs`, and serves the health endpoints.
//!
//! ```text
//!   ticks ──▶ outgoing channel ──┐                    ┌──▶ incoming channel ──▶ log
//!                                ▼                    │
//!                          ┌───────────────────────────┐
//!                          │      InMemoryBroker       │  (unreachable during outage)
//!                          └───────────────────────────┘
//!   GET /health, /health/ready, /health/live ◀── HealthRegistry
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::StreamExt;
use tokio::net::TcpListener;

use resilient_connector::admin::setup_admin_router;
use resilient_connector::broker::{InMemoryBroker, Record, UnreachableMode};
use resilient_connector::config::{load_config, ChannelConfig, ConnectorConfig, Direction};
use resilient_connector::connector::Connector;
use resilient_connector::lifecycle::{wait_for_signal, Shutdown};
use resilient_connector::observability::{logging::init_logging, metrics::init_metrics};
use resilient_connector::stream::{ticks, StreamFailure};

#[derive(Parser)]
#[command(name = "connector-sim")]
#[command(about = "Run connector channels against a simulated broker outage", long_about = None)]
struct Args {
    /// TOML configuration; a single outgoing/incoming pair is used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds the broker stays unreachable after startup
    #[arg(long, default_value_t = 5)]
    outage_secs: u64,

    /// Black-hole broker calls during the outage instead of refusing them
    #[arg(long)]
    blackhole: bool,

    /// Interval between generated records, per outgoing channel
    #[arg(long, default_value_t = 500)]
    tick_ms: u64,
}

fn default_config() -> ConnectorConfig {
    let mut outgoing = ChannelConfig::new("readings-out", Direction::Outgoing);
    outgoing.topic = Some("readings".to_string());
    let mut incoming = ChannelConfig::new("readings-in", Direction::Incoming);
    incoming.topic = Some("readings".to_string());
    incoming.health_topic_verification_enabled = true;
    ConnectorConfig {
        channels: vec![outgoing, incoming],
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    init_logging(&config.observability)?;

    tracing::info!(
        channels = config.channels.len(),
        outage_secs = args.outage_secs,
        "connector-sim v0.1.0 starting"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let mode = if args.blackhole {
        UnreachableMode::Blackhole
    } else {
        UnreachableMode::Refuse
    };
    let broker = InMemoryBroker::unreachable(mode);
    let connector = Arc::new(Connector::new(config.clone(), Arc::new(broker.clone()))?);
    let shutdown = Shutdown::new();

    for channel in &config.channels {
        match channel.direction {
            Direction::Outgoing => {
                let name = channel.name.clone();
                let records = ticks(Duration::from_millis(args.tick_ms))
                    .map(move |n| {
                        Ok::<_, StreamFailure>(Record::from_i32(n as i32).with_key(name.clone()))
                    });
                connector.sink(&channel.name, records)?;
            }
            Direction::Incoming => {
                let mut source = connector.source(&channel.name)?;
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = stop.recv() => break,
                            record = source.recv() => match record {
                                Some(record) => tracing::info!(
                                    channel = source.name(),
                                    offset = record.offset,
                                    value = ?record.value_i32(),
                                    "Record received"
                                ),
                                None => break,
                            },
                        }
                    }
                });
            }
        }
    }

    {
        let broker = broker.clone();
        let outage = Duration::from_secs(args.outage_secs);
        tokio::spawn(async move {
            tokio::time::sleep(outage).await;
            broker.set_reachable(true);
            tracing::info!("Simulated outage over; broker reachable");
        });
    }

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Health endpoints listening");
        let router = setup_admin_router(connector.registry().clone());
        let stop = shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(Shutdown::wait(stop))
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Health server failed");
            }
        });
    }

    let signal = wait_for_signal().await;
    tracing::info!(signal, "Shutdown requested");
    shutdown.trigger();
    connector.close();

    tracing::info!("Shutdown complete");
    Ok(())
}
