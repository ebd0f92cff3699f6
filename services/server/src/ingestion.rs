//! Topic subscription and message-to-event derivation.
//!
//! Every subscribed topic has exactly one entry in the dispatch table, so a
//! message is handled once no matter how often its topic was requested.
//! Persistence from [`IngestionPipeline::on_message`] is spawned and not
//! awaited: the raw append and the derived event are independent writes and
//! either may fail without affecting the other.

use crate::error::StoreResult;
use crate::event_store::EventStore;
use crate::topic_registry::{resumable_topics, validate_topic_name, TopicRegistry};
use parking_lot::{Mutex, RwLock};
use relay_pipeline::{BusConnector, Event, IncomingMessage};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Result of a subscription request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum SubscribeOutcome {
    AlreadySubscribed,
    Subscribed,
    Failed(String),
}

impl SubscribeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SubscribeOutcome::Failed(_))
    }

    pub fn message(&self, topic: &str) -> String {
        match self {
            SubscribeOutcome::AlreadySubscribed => format!("Already subscribed to {}", topic),
            SubscribeOutcome::Subscribed => format!("Subscribed to {}", topic),
            SubscribeOutcome::Failed(reason) => {
                format!("Failed to subscribe to {}: {}", topic, reason)
            }
        }
    }
}

/// Topics handled by a startup resume
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResumeReport {
    pub resumed: Vec<String>,
    pub failed: Vec<String>,
}

pub struct IngestionPipeline {
    registry: Arc<dyn TopicRegistry>,
    store: Arc<dyn EventStore>,
    bus: Arc<dyn BusConnector>,
    /// Topics whose messages are routed through `on_message`
    routes: RwLock<HashSet<String>>,
    /// Registered topics whose bus subscription has not been re-established
    pending: Mutex<BTreeSet<String>>,
    /// Serializes registry+bus changes
    subscribe_lock: tokio::sync::Mutex<()>,
    tasks: TaskTracker,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<dyn TopicRegistry>,
        store: Arc<dyn EventStore>,
        bus: Arc<dyn BusConnector>,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            routes: RwLock::new(HashSet::new()),
            pending: Mutex::new(BTreeSet::new()),
            subscribe_lock: tokio::sync::Mutex::new(()),
            tasks: TaskTracker::new(),
        }
    }

    /// Register `topic` and subscribe the bus to it.
    ///
    /// A topic that is already routed is left alone. A new registration is
    /// undone if the bus refuses the subscription.
    #[instrument(skip(self))]
    pub async fn subscribe_to_topic(&self, topic: &str) -> SubscribeOutcome {
        let _guard = self.subscribe_lock.lock().await;

        if let Err(e) = validate_topic_name(topic) {
            return SubscribeOutcome::Failed(e.to_string());
        }

        if self.routes.read().contains(topic) {
            debug!(topic = %topic, "Topic already subscribed");
            return SubscribeOutcome::AlreadySubscribed;
        }

        let registered = match self.registry.contains(topic).await {
            Ok(registered) => registered,
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to read topic registry");
                return SubscribeOutcome::Failed(e.to_string());
            }
        };

        if registered {
            // Committed earlier but its resume has not succeeded yet
            self.add_route(topic);
            return match self.bus.subscribe(topic).await {
                Ok(()) => SubscribeOutcome::AlreadySubscribed,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Bus subscription for registered topic failed");
                    self.remove_route(topic);
                    self.pending.lock().insert(topic.to_string());
                    SubscribeOutcome::Failed(e.to_string())
                }
            };
        }

        match self.registry.register(topic).await {
            Ok(registration) => {
                debug!(topic = %topic, created = registration.created, "Topic registered");
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to register topic");
                return SubscribeOutcome::Failed(e.to_string());
            }
        }

        // Routed before the bus delivers so the first messages are not dropped
        self.add_route(topic);

        if let Err(e) = self.bus.subscribe(topic).await {
            error!(topic = %topic, error = %e, "Bus subscription failed, removing registration");
            self.remove_route(topic);
            if let Err(undo) = self.registry.unregister(topic).await {
                // Still registered, so leave it to the resume retries
                error!(topic = %topic, error = %undo, "Failed to remove registration");
                self.pending.lock().insert(topic.to_string());
            }
            return SubscribeOutcome::Failed(e.to_string());
        }

        info!(topic = %topic, "Subscribed to topic");
        SubscribeOutcome::Subscribed
    }

    /// Re-establish bus subscriptions for every registered topic not in
    /// `excluded`. Topics that fail are kept for [`Self::retry_pending`].
    pub async fn resume(&self, excluded: &[String]) -> StoreResult<ResumeReport> {
        let _guard = self.subscribe_lock.lock().await;

        let topics = resumable_topics(self.registry.as_ref(), excluded).await?;
        let mut report = ResumeReport::default();

        for topic in topics {
            if self.routes.read().contains(&topic) {
                continue;
            }
            match self.bus.subscribe(&topic).await {
                Ok(()) => {
                    self.add_route(&topic);
                    report.resumed.push(topic);
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Failed to resume topic");
                    self.pending.lock().insert(topic.clone());
                    report.failed.push(topic);
                }
            }
        }

        info!(
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            "Topic subscriptions resumed"
        );

        Ok(report)
    }

    /// One retry pass over topics that failed to resume. Returns how many are
    /// still pending.
    pub async fn retry_pending(&self) -> usize {
        let _guard = self.subscribe_lock.lock().await;

        let pending: Vec<String> = self.pending.lock().iter().cloned().collect();
        for topic in pending {
            match self.bus.subscribe(&topic).await {
                Ok(()) => {
                    info!(topic = %topic, "Resumed topic on retry");
                    self.add_route(&topic);
                }
                Err(e) => debug!(topic = %topic, error = %e, "Topic still unavailable"),
            }
        }

        self.pending.lock().len()
    }

    /// Retry pending topics every `interval` until cancelled
    pub async fn run_resume_retry(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.pending.lock().is_empty() {
                        continue;
                    }
                    let remaining = self.retry_pending().await;
                    if remaining > 0 {
                        warn!(remaining, "Topics still waiting for bus subscription");
                    }
                }
            }
        }
    }

    /// Handle one inbound message. Never blocks on persistence.
    pub fn on_message(&self, message: IncomingMessage) {
        metrics::counter!("relay.messages.received").increment(1);

        if !self.routes.read().contains(&message.topic) {
            debug!(topic = %message.topic, "No route for topic, dropping message");
            return;
        }

        let payload = match message.decode_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    bytes = message.payload.len(),
                    error = %e,
                    "Dropping malformed payload"
                );
                metrics::counter!("relay.messages.malformed").increment(1);
                return;
            }
        };

        let store = self.store.clone();
        let topic = message.topic.clone();
        let raw = payload.clone();
        let received_at = message.received_at;
        self.tasks.spawn(async move {
            if let Err(e) = store.append_raw(&topic, &raw, received_at).await {
                error!(topic = %topic, error = %e, "Failed to persist raw message");
                metrics::counter!("relay.raw.failed").increment(1);
            }
        });

        let store = self.store.clone();
        let event = Event::detect(message.topic, payload);
        self.tasks.spawn(async move {
            match store.insert(&event).await {
                Ok(()) => {
                    debug!(event_id = %event.id, topic = %event.topic, "Event derived");
                    metrics::counter!("relay.events.derived").increment(1);
                }
                Err(e) => {
                    error!(topic = %event.topic, error = %e, "Failed to persist derived event");
                    metrics::counter!("relay.events.failed").increment(1);
                }
            }
        });
    }

    /// Dispatch loop over the bus channel
    pub async fn run(&self, mut rx: mpsc::Receiver<IncomingMessage>) {
        info!("Starting ingestion dispatcher");

        while let Some(message) = rx.recv().await {
            self.on_message(message);
        }

        info!("Ingestion dispatcher stopped");
    }

    /// Wait for every spawned persistence task to finish
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.routes.read().contains(topic)
    }

    pub fn pending_topics(&self) -> Vec<String> {
        self.pending.lock().iter().cloned().collect()
    }

    fn add_route(&self, topic: &str) {
        if self.routes.write().insert(topic.to_string()) {
            metrics::gauge!("relay.topics.subscribed").increment(1.0);
        }
        self.pending.lock().remove(topic);
    }

    fn remove_route(&self, topic: &str) {
        if self.routes.write().remove(topic) {
            metrics::gauge!("relay.topics.subscribed").decrement(1.0);
        }
    }
}
