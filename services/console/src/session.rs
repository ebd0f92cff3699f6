//! Operator session: owns the engines and every periodic task driving them.
//!
//! All tasks share one cancellation token and one tracker, so
//! [`Session::shutdown`] returns only after the last task has stopped.

use crate::alarms::{AlarmBook, SharedAlarms};
use crate::api_client::RelayApi;
use crate::config::ConsoleConfig;
use crate::event_feed::EventReconciler;
use crate::sensor_feed::SensorReconciler;
use crate::subscriptions::SubscriptionManager;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

pub struct Session {
    feed: Arc<EventReconciler>,
    sensors: Arc<SensorReconciler>,
    subscriptions: Arc<SubscriptionManager>,
    alarms: SharedAlarms,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Session {
    /// Build the engines and start polling, subscription and timeout tasks
    pub fn start(config: &ConsoleConfig, api: Arc<dyn RelayApi>) -> Self {
        let alarms = AlarmBook::shared();

        let feed = Arc::new(EventReconciler::new(
            api.clone(),
            alarms.clone(),
            config.feed.max_events,
            config.api.operator.clone(),
        ));
        let sensors = Arc::new(SensorReconciler::new(api.clone(), &config.sensors));

        let mut topics = config.subscriptions.topics.clone();
        if !topics.contains(&config.sensors.status_topic) {
            topics.push(config.sensors.status_topic.clone());
        }
        let subscriptions = Arc::new(SubscriptionManager::new(api, alarms.clone(), topics));

        let session = Self {
            feed,
            sensors,
            subscriptions,
            alarms,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };

        session.spawn_subscriptions(config.subscriptions.retry_interval());

        let feed = session.feed.clone();
        session.spawn_periodic("event-poll", config.feed.poll_interval(), move || {
            let feed = feed.clone();
            async move {
                let _ = feed.poll_once().await;
            }
        });

        let sensors = session.sensors.clone();
        session.spawn_periodic("sensor-poll", config.sensors.poll_interval(), move || {
            let sensors = sensors.clone();
            async move {
                let _ = sensors.poll_once().await;
            }
        });

        let sensors = session.sensors.clone();
        session.spawn_periodic(
            "timeout-check",
            config.sensors.timeout_check_interval(),
            move || {
                let sensors = sensors.clone();
                async move {
                    sensors.check_timeouts(Utc::now()).await;
                }
            },
        );

        info!(tasks = session.tasks.len(), "Session started");
        session
    }

    pub fn feed(&self) -> &Arc<EventReconciler> {
        &self.feed
    }

    pub fn sensors(&self) -> &Arc<SensorReconciler> {
        &self.sensors
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn alarms(&self) -> &SharedAlarms {
        &self.alarms
    }

    /// Stop every task and wait for them to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Session stopped");
    }

    fn spawn_subscriptions(&self, retry_interval: Duration) {
        let subscriptions = self.subscriptions.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                connected = subscriptions.bootstrap() => {
                    debug!(connected, "Subscription bootstrap finished");
                }
            }
            subscriptions.run_retry(retry_interval, cancel).await;
        });
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }

            debug!(task = name, "Periodic task stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::fake::FakeApi;
    use crate::subscriptions::SubscriptionStatus;
    use relay_pipeline::{Category, Event};
    use serde_json::json;

    fn test_config() -> ConsoleConfig {
        let mut config = ConsoleConfig::default();
        config.subscriptions.topics = vec!["gas".to_string()];
        config.sensors.sensor_ids = vec!["S1".to_string()];
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_polls_and_subscribes() {
        let mut threat = Event::detect("gas", json!({}));
        threat.category = Category::Threat;
        let api = Arc::new(FakeApi::with_events(vec![threat]));

        let session = Session::start(&test_config(), api.clone());
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(
            session.subscriptions().status("gas"),
            Some(SubscriptionStatus::Connected)
        );
        assert_eq!(
            session.subscriptions().status("sensor_status"),
            Some(SubscriptionStatus::Connected)
        );
        assert_eq!(session.feed().snapshot().entries[0].category, Category::Threat);
        assert_eq!(session.sensors().snapshot().sensors.len(), 1);

        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_periodic_work() {
        let api = Arc::new(FakeApi::default());
        api.state.lock().rejected_topics.insert("gas".to_string());

        let session = Session::start(&test_config(), api.clone());
        tokio::time::sleep(Duration::from_secs(65)).await;
        session.shutdown().await;

        let (fetches, subscribes) = {
            let state = api.state.lock();
            (state.fetches, state.subscribe_calls.len())
        };
        assert!(fetches > 0);
        assert!(subscribes > 2);

        tokio::time::sleep(Duration::from_secs(300)).await;
        let state = api.state.lock();
        assert_eq!(state.fetches, fetches);
        assert_eq!(state.subscribe_calls.len(), subscribes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failure_shows_in_feed() {
        let api = Arc::new(FakeApi::default());
        api.state.lock().rejected_topics.insert("gas".to_string());

        let session = Session::start(&test_config(), api);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let entries = session.feed().snapshot().entries;
        assert!(entries
            .iter()
            .any(|e| e.category == Category::Alarm && e.topic == "subscription_failure"));
        assert!(session.alarms().lock().has_active());

        session.shutdown().await;
    }
}
