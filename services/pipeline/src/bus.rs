//! Message bus abstraction.
//!
//! The relay holds one logical bus connection. Topics are added to it one at a
//! time through [`BusConnector::subscribe`], and every message on a subscribed
//! topic is forwarded into a single channel by [`BusConnector::run`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Errors raised by bus connectors
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Failed to create bus client: {0}")]
    Creation(String),

    #[error("Failed to subscribe to topic {topic}: {message}")]
    Subscription { topic: String, message: String },

    #[error("Failed to publish to topic {topic}: {message}")]
    Publish { topic: String, message: String },

    #[error("Bus connection error: {0}")]
    Connection(String),
}

/// A message received from the bus
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Topic the message arrived on
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Local receive time
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Parse the payload as JSON
    pub fn decode_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// One logical connection to the message bus
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Add a topic to the connection. Subscribing twice is a no-op.
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    /// Topics currently subscribed
    fn subscriptions(&self) -> Vec<String>;

    /// Forward incoming messages into `sink` until [`BusConnector::shutdown`]
    /// is called or the sink is closed
    async fn run(&self, sink: mpsc::Sender<IncomingMessage>) -> Result<(), BusError>;

    /// Stop a running [`BusConnector::run`] loop
    fn shutdown(&self);
}

/// In-process bus used for local runs and tests.
///
/// Messages published on a topic nobody subscribed to are dropped, the same
/// way a broker would never deliver them to this client.
pub struct MemoryBus {
    subscriptions: Mutex<BTreeSet<String>>,
    rejected: Mutex<HashSet<String>>,
    inbox_tx: mpsc::UnboundedSender<IncomingMessage>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IncomingMessage>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            subscriptions: Mutex::new(BTreeSet::new()),
            rejected: Mutex::new(HashSet::new()),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            shutdown_tx,
        }
    }

    /// Publish a payload. Returns `false` when the topic has no subscription.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        if !self.subscriptions.lock().contains(topic) {
            debug!(topic = %topic, "Dropping message for unsubscribed topic");
            return false;
        }
        self.inbox_tx
            .send(IncomingMessage::new(topic, payload))
            .is_ok()
    }

    /// Make future subscriptions to `topic` fail
    pub fn reject_subscriptions(&self, topic: &str) {
        self.rejected.lock().insert(topic.to_string());
    }

    /// Undo [`MemoryBus::reject_subscriptions`]
    pub fn accept_subscriptions(&self, topic: &str) {
        self.rejected.lock().remove(topic);
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        if self.rejected.lock().contains(topic) {
            return Err(BusError::Subscription {
                topic: topic.to_string(),
                message: "subscription rejected".to_string(),
            });
        }
        self.subscriptions.lock().insert(topic.to_string());
        Ok(())
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    async fn run(&self, sink: mpsc::Sender<IncomingMessage>) -> Result<(), BusError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut inbox = self.inbox_rx.lock().await;

        info!("Starting in-memory bus loop");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    if sink.send(message).await.is_err() {
                        debug!("Message sink closed");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_decode_json() {
        let ok = IncomingMessage::new("gas", br#"{"co2": 900}"#.to_vec());
        assert_eq!(ok.decode_json().unwrap()["co2"], 900);

        let bad = IncomingMessage::new("gas", b"not json".to_vec());
        assert!(bad.decode_json().is_err());
    }

    #[tokio::test]
    async fn test_memory_bus_delivers_only_subscribed_topics() {
        let bus = Arc::new(MemoryBus::new());
        bus.subscribe("gas").await.unwrap();
        bus.subscribe("gas").await.unwrap();
        assert_eq!(bus.subscriptions(), vec!["gas".to_string()]);

        assert!(bus.publish("gas", b"{}".to_vec()));
        assert!(!bus.publish("motion", b"{}".to_vec()));

        let (tx, mut rx) = mpsc::channel(8);
        let runner = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.run(tx).await })
        };

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "gas");

        bus.shutdown();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_memory_bus_rejected_subscription() {
        let bus = MemoryBus::new();
        bus.reject_subscriptions("gas");
        assert!(matches!(
            bus.subscribe("gas").await,
            Err(BusError::Subscription { .. })
        ));
        bus.accept_subscriptions("gas");
        assert!(bus.subscribe("gas").await.is_ok());
    }
}
