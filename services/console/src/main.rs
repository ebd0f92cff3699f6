//! Headless operator console for the relay.
//!
//! Runs the reconciliation engines against a relay server and logs the
//! prioritized feed and sensor view whenever they change.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/console.toml, /etc/relay/console.toml)
//! 2. Environment variables (prefixed with CONSOLE__)

use anyhow::Context;
use relay_console::config::LoggingConfig;
use relay_console::{ConsoleConfig, FeedSnapshot, HttpRelayApi, SensorSnapshot, Session};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = ConsoleConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "relay-console",
        version = env!("CARGO_PKG_VERSION"),
        api = %config.api.base_url,
        "Starting relay console"
    );

    // Validate configuration
    config.validate()?;

    let api = Arc::new(
        HttpRelayApi::new(config.api.base_url.clone(), config.api.request_timeout())
            .context("Failed to create relay API client")?,
    );

    let session = Session::start(&config, api);

    let feed_rx = session.feed().subscribe();
    let sensor_rx = session.sensors().subscribe();
    let printer = tokio::spawn(log_updates(feed_rx, sensor_rx));

    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal");

    session.shutdown().await;
    printer.abort();

    info!("Relay console stopped");
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("relay_console={}", level).parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

async fn log_updates(
    mut feed_rx: watch::Receiver<FeedSnapshot>,
    mut sensor_rx: watch::Receiver<SensorSnapshot>,
) {
    loop {
        tokio::select! {
            changed = feed_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = feed_rx.borrow_and_update().clone();
                log_feed(&snapshot);
            }
            changed = sensor_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = sensor_rx.borrow_and_update().clone();
                log_sensors(&snapshot);
            }
        }
    }
}

fn log_feed(snapshot: &FeedSnapshot) {
    if !snapshot.server_reachable {
        warn!(entries = snapshot.entries.len(), "Relay server unreachable, showing last known feed");
    }

    for event in snapshot.entries.iter().take(5) {
        info!(
            event_id = %event.id,
            category = %event.category,
            topic = %event.topic,
            acknowledged = event.acknowledged,
            created_at = %event.created_at,
            "Feed entry"
        );
    }
}

fn log_sensors(snapshot: &SensorSnapshot) {
    for sensor in &snapshot.sensors {
        info!(
            sensor_id = %sensor.sensor_id,
            sensor_type = %sensor.sensor_type,
            status = %sensor.status,
            timed_out = sensor.timed_out,
            "Sensor"
        );
    }

    if snapshot.has_active_alarms {
        warn!("Sensor alarms active");
    }
}
