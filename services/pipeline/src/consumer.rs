//! Kafka-backed bus connector.
//!
//! Keeps a single `StreamConsumer` whose subscription grows one topic at a
//! time. rdkafka replaces the subscription list on every call, so the full set
//! of topics is re-sent whenever a new one is added.

use crate::bus::{BusConnector, BusError, IncomingMessage};
use crate::config::KafkaConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

/// Bus connector over a Kafka consumer group
pub struct KafkaConnector {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    topics: Mutex<BTreeSet<String>>,
    shutdown_tx: watch::Sender<bool>,
}

impl KafkaConnector {
    /// Create a new connector with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, BusError> {
        info!(
            "Creating Kafka connector for {} with group {}",
            config.bootstrap_servers, config.consumer.group_id
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| BusError::Creation(e.to_string()))?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            topics: Mutex::new(BTreeSet::new()),
            shutdown_tx,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    fn add_topic(&self, topic: &str) -> Result<bool, BusError> {
        let mut topics = self.topics.lock();
        if topics.contains(topic) {
            return Ok(false);
        }

        let mut next = topics.clone();
        next.insert(topic.to_string());
        let list: Vec<&str> = next.iter().map(String::as_str).collect();

        self.consumer
            .subscribe(&list)
            .map_err(|e| BusError::Subscription {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        *topics = next;
        Ok(true)
    }

    fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
        IncomingMessage::new(msg.topic(), msg.payload().unwrap_or(&[]).to_vec())
    }

    fn commit_async(&self) {
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Async) {
            warn!("Failed to commit offsets asynchronously: {}", e);
        }
    }
}

#[async_trait]
impl BusConnector for KafkaConnector {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        if self.add_topic(topic)? {
            info!(topic = %topic, "Subscribed to bus topic");
        }
        Ok(())
    }

    fn subscriptions(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }

    #[instrument(skip(self, sink))]
    async fn run(&self, sink: mpsc::Sender<IncomingMessage>) -> Result<(), BusError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting bus consumption loop");

        loop {
            if *shutdown_rx.borrow() {
                info!("Received shutdown signal");
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                message_result = stream.next() => {
                    let message_result = message_result.map(|result| {
                        result.map(|borrowed_message| {
                            debug!(
                                topic = %borrowed_message.topic(),
                                partition = borrowed_message.partition(),
                                offset = borrowed_message.offset(),
                                "Received bus message"
                            );
                            Self::convert_message(&borrowed_message)
                        })
                    });

                    match message_result {
                        Some(Ok(incoming)) => {
                            if sink.send(incoming).await.is_err() {
                                debug!("Message sink closed");
                                break;
                            }
                            if !self.config.consumer.enable_auto_commit {
                                self.commit_async();
                            }
                        }
                        Some(Err(e)) => {
                            error!("Kafka error: {}", e);
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if !self.config.consumer.enable_auto_commit {
            if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
                warn!("Failed to commit on shutdown: {}", e);
            }
        }

        Ok(())
    }

    fn shutdown(&self) {
        info!("Signaling bus shutdown");
        self.shutdown_tx.send_replace(true);
    }
}
