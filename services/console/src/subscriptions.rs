//! Keeps the session's topics subscribed on the relay server.

use crate::alarms::{AlarmKey, SharedAlarms};
use crate::api_client::RelayApi;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    NeverAttempted,
    Connected,
    Failed,
}

pub struct SubscriptionManager {
    api: Arc<dyn RelayApi>,
    alarms: SharedAlarms,
    status: Mutex<BTreeMap<String, SubscriptionStatus>>,
}

impl SubscriptionManager {
    pub fn new<I, S>(api: Arc<dyn RelayApi>, alarms: SharedAlarms, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let status = topics
            .into_iter()
            .map(|t| (t.into(), SubscriptionStatus::NeverAttempted))
            .collect();
        Self {
            api,
            alarms,
            status: Mutex::new(status),
        }
    }

    /// Subscribe every topic that was never attempted or last failed
    pub async fn bootstrap(&self) -> usize {
        let topics = self.topics_where(|s| {
            matches!(s, SubscriptionStatus::NeverAttempted | SubscriptionStatus::Failed)
        });
        self.attempt_all(topics).await
    }

    /// Retry only the topics currently marked failed
    pub async fn retry_failed(&self) -> usize {
        let topics = self.topics_where(|s| s == SubscriptionStatus::Failed);
        self.attempt_all(topics).await
    }

    /// Retry failed topics every `interval` until cancelled
    pub async fn run_retry(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.retry_failed().await;
                }
            }
        }
    }

    pub fn status(&self, topic: &str) -> Option<SubscriptionStatus> {
        self.status.lock().get(topic).copied()
    }

    pub fn statuses(&self) -> BTreeMap<String, SubscriptionStatus> {
        self.status.lock().clone()
    }

    fn topics_where(&self, pred: impl Fn(SubscriptionStatus) -> bool) -> Vec<String> {
        self.status
            .lock()
            .iter()
            .filter(|(_, s)| pred(**s))
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Returns how many topics are connected afterwards
    async fn attempt_all(&self, topics: Vec<String>) -> usize {
        for topic in topics {
            self.attempt(&topic).await;
        }
        self.topics_where(|s| s == SubscriptionStatus::Connected).len()
    }

    async fn attempt(&self, topic: &str) {
        let result = self.api.subscribe(topic).await;
        let now = Utc::now();
        let key = AlarmKey::subscription_failure(topic);

        let status = match result {
            Ok(()) => {
                info!(topic = %topic, "Topic subscribed");
                self.alarms.lock().clear(&key, now);
                SubscriptionStatus::Connected
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Topic subscription failed");
                self.alarms
                    .lock()
                    .raise(key, format!("Subscription to {} failed: {}", topic, e), now);
                SubscriptionStatus::Failed
            }
        };

        self.status.lock().insert(topic.to_string(), status);
    }
}
