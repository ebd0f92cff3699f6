//! relay-publish - push JSON payloads onto a bus topic
//!
//! ```text
//! relay-publish <topic> '<json>'     publish one payload
//! relay-publish <topic> -            publish one payload per stdin line
//! ```

use anyhow::{bail, Context, Result};
use relay_pipeline::{BusPublisher, KafkaConfig};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

async fn publish_line(publisher: &BusPublisher, topic: &str, line: &str) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(line)
        .with_context(|| format!("Payload is not valid JSON: {}", line))?;

    let result = publisher.publish_json(topic, &payload).await?;
    info!(
        "Published to {} partition {} at offset {}",
        result.topic, result.partition, result.offset
    );
    Ok(())
}

fn print_usage() {
    println!("Usage: relay-publish <topic> <json|->");
    println!();
    println!("Environment variables:");
    println!("  KAFKA_BOOTSTRAP_SERVERS - Kafka broker addresses (default: localhost:9092)");
    println!("  KAFKA_CLIENT_ID         - Client ID (default: relay)");
    println!("  KAFKA_SECURITY_PROTOCOL - Security protocol (plaintext, ssl, sasl_ssl)");
    println!("  KAFKA_SASL_USERNAME     - SASL username");
    println!("  KAFKA_SASL_PASSWORD     - SASL password");
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().collect();
    let (topic, source) = match (args.get(1), args.get(2)) {
        (Some(topic), Some(source)) => (topic.clone(), source.clone()),
        _ => {
            print_usage();
            bail!("missing arguments");
        }
    };

    let config = KafkaConfig::from_env()?;
    config.validate()?;
    let publisher = BusPublisher::new(config)?;

    if source == "-" {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = publish_line(&publisher, &topic, line).await {
                warn!("Skipping line: {:#}", e);
            }
        }
    } else if let Err(e) = publish_line(&publisher, &topic, &source).await {
        error!("Publish failed: {:#}", e);
        return Err(e);
    }

    publisher.flush(Duration::from_secs(5))?;
    Ok(())
}
