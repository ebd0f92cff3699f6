//! Kafka publisher used by sensors and tooling to push JSON payloads onto the bus.

use crate::bus::BusError;
use crate::config::KafkaConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Result of a successful publish
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Thin wrapper over a Kafka producer
pub struct BusPublisher {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
}

impl BusPublisher {
    /// Create a new publisher with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, BusError> {
        info!("Creating Kafka publisher for {}", config.bootstrap_servers);

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| BusError::Creation(e.to_string()))?;

        Ok(Self {
            producer,
            config: Arc::new(config),
        })
    }

    /// Publish raw bytes and wait for delivery
    #[instrument(skip(self, payload), fields(size = payload.len()))]
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<DeliveryResult, BusError> {
        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(topic).payload(payload);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.config.request_timeout()))
            .await
            .map_err(|(e, _)| BusError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        debug!(
            "Message delivered to partition {} at offset {}",
            partition, offset
        );

        Ok(DeliveryResult {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    /// Serialize a JSON value and publish it
    pub async fn publish_json(
        &self,
        topic: &str,
        payload: &serde_json::Value,
    ) -> Result<DeliveryResult, BusError> {
        let bytes = serde_json::to_vec(payload).map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })?;
        self.publish(topic, &bytes).await
    }

    /// Wait for all in-flight messages to be delivered
    pub fn flush(&self, timeout: Duration) -> Result<(), BusError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| BusError::Connection(e.to_string()))
    }
}
