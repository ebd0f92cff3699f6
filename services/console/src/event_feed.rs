//! Event reconciliation engine.
//!
//! Each poll replaces the server view wholesale, clears or raises the
//! "server unreachable" alarm, then republishes the prioritized feed. Operator
//! actions go through the relay API and are applied locally as soon as the
//! server confirms them.

use crate::alarms::{AlarmKey, SharedAlarms};
use crate::api_client::{ApiError, RelayApi};
use crate::feed::prioritize;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_pipeline::{Event, EventPatch};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scope of the alarm raised when `/event` cannot be polled
pub const EVENTS_ENDPOINT: &str = "events";

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Event {0} is not in the feed")]
    NotInFeed(Uuid),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Published view of the feed
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    pub entries: Vec<Event>,
    pub server_reachable: bool,
    pub last_success: Option<DateTime<Utc>>,
}

pub struct EventReconciler {
    api: Arc<dyn RelayApi>,
    alarms: SharedAlarms,
    max_events: usize,
    operator: String,
    server_events: Mutex<Vec<Event>>,
    state: Mutex<PollState>,
    snapshot_tx: watch::Sender<FeedSnapshot>,
}

#[derive(Debug, Default)]
struct PollState {
    reachable: bool,
    last_success: Option<DateTime<Utc>>,
}

impl EventReconciler {
    pub fn new(
        api: Arc<dyn RelayApi>,
        alarms: SharedAlarms,
        max_events: usize,
        operator: impl Into<String>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(FeedSnapshot::default());
        Self {
            api,
            alarms,
            max_events,
            operator: operator.into(),
            server_events: Mutex::new(Vec::new()),
            state: Mutex::new(PollState::default()),
            snapshot_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// One polling cycle. Existing state survives a failed fetch.
    pub async fn poll_once(&self) -> Result<usize, ApiError> {
        let now = Utc::now();
        let result = self.api.fetch_events().await;
        let key = AlarmKey::fetch_failure(EVENTS_ENDPOINT);

        let outcome = match result {
            Ok(events) => {
                let count = events.len();
                *self.server_events.lock() = events;
                if self.alarms.lock().clear(&key, now) {
                    info!("Relay server reachable again");
                }
                let mut state = self.state.lock();
                state.reachable = true;
                state.last_success = Some(now);
                Ok(count)
            }
            Err(e) => {
                let raised = self
                    .alarms
                    .lock()
                    .raise(key, format!("Unable to fetch events: {}", e), now);
                warn!(
                    error = %e,
                    occurrences = raised.alarm().occurrences,
                    "Event poll failed"
                );
                self.state.lock().reachable = false;
                Err(e)
            }
        };

        self.publish();
        outcome
    }

    /// Rebuild the feed from the current server view and alarm book
    pub fn publish(&self) {
        let server = self.server_events.lock().clone();
        let alarms = self.alarms.lock().active();
        let entries = prioritize(server, &alarms, self.max_events);

        let (server_reachable, last_success) = {
            let state = self.state.lock();
            (state.reachable, state.last_success)
        };

        self.snapshot_tx.send_replace(FeedSnapshot {
            entries,
            server_reachable,
            last_success,
        });
    }

    pub async fn acknowledge(&self, id: Uuid) -> Result<Event, FeedError> {
        let event = self.find(id)?;
        match EventPatch::acknowledge(&event, &self.operator) {
            Some(patch) => self.apply(id, patch).await,
            None => Ok(event),
        }
    }

    pub async fn add_note(&self, id: Uuid, text: &str) -> Result<Event, FeedError> {
        let event = self.find(id)?;
        let patch = EventPatch::add_note(&event, text, &self.operator);
        self.apply(id, patch).await
    }

    /// Escalate to THREAT. Already-THREAT events are returned unchanged.
    pub async fn escalate(&self, id: Uuid) -> Result<Event, FeedError> {
        let event = self.find(id)?;
        match EventPatch::escalate(&event, &self.operator) {
            Some(patch) => self.apply(id, patch).await,
            None => {
                debug!(event_id = %id, "Event already escalated");
                Ok(event)
            }
        }
    }

    /// Undo an escalation. Events that were not escalated are returned unchanged.
    pub async fn revert(&self, id: Uuid) -> Result<Event, FeedError> {
        let event = self.find(id)?;
        match EventPatch::revert(&event, &self.operator) {
            Some(patch) => self.apply(id, patch).await,
            None => {
                debug!(event_id = %id, "Event has no escalation to revert");
                Ok(event)
            }
        }
    }

    fn find(&self, id: Uuid) -> Result<Event, FeedError> {
        self.server_events
            .lock()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(FeedError::NotInFeed(id))
    }

    async fn apply(&self, id: Uuid, patch: EventPatch) -> Result<Event, FeedError> {
        let updated = self.api.update_event(id, &patch).await?;

        {
            let mut events = self.server_events.lock();
            if let Some(slot) = events.iter_mut().find(|e| e.id == id) {
                *slot = updated.clone();
            }
        }

        self.publish();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::AlarmBook;
    use crate::api_client::fake::FakeApi;
    use chrono::Duration;
    use relay_pipeline::Category;
    use serde_json::json;

    fn event(category: Category, minutes_ago: i64) -> Event {
        let mut event = Event::detect("gas", json!({"co2": 900}));
        event.category = category;
        event.created_at = Utc::now() - Duration::minutes(minutes_ago);
        event
    }

    fn reconciler(api: Arc<FakeApi>, alarms: SharedAlarms) -> EventReconciler {
        EventReconciler::new(api, alarms, 400, "ops")
    }

    #[tokio::test]
    async fn test_poll_publishes_prioritized_feed() {
        let api = Arc::new(FakeApi::with_events(vec![
            event(Category::Detect, 1),
            event(Category::Threat, 10),
            event(Category::Alert, 2),
        ]));
        let feed = reconciler(api, AlarmBook::shared());
        let mut rx = feed.subscribe();

        assert_eq!(feed.poll_once().await.unwrap(), 3);
        assert!(rx.has_changed().unwrap());

        let snapshot = rx.borrow_and_update().clone();
        assert!(snapshot.server_reachable);
        assert_eq!(snapshot.entries[0].category, Category::Threat);
        assert_eq!(snapshot.entries[2].category, Category::Detect);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_state_and_raises_one_alarm() {
        let api = Arc::new(FakeApi::with_events(vec![event(Category::Alert, 1)]));
        let alarms = AlarmBook::shared();
        let feed = reconciler(api.clone(), alarms.clone());
        feed.poll_once().await.unwrap();

        api.state.lock().unreachable = true;
        assert!(feed.poll_once().await.is_err());
        assert!(feed.poll_once().await.is_err());

        let snapshot = feed.snapshot();
        assert!(!snapshot.server_reachable);
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[0].category, Category::Alarm);
        assert_eq!(snapshot.entries[0].data["occurrences"], 2);
        assert_eq!(alarms.lock().active().len(), 1);

        api.state.lock().unreachable = false;
        feed.poll_once().await.unwrap();

        let snapshot = feed.snapshot();
        assert!(snapshot.server_reachable);
        assert_eq!(snapshot.entries.len(), 1);
        let key = AlarmKey::fetch_failure(EVENTS_ENDPOINT);
        let resolved = alarms.lock().get(&key).cloned().unwrap();
        assert!(!resolved.active);
    }

    #[tokio::test]
    async fn test_acknowledge_updates_feed_without_waiting_for_poll() {
        let target = event(Category::Alert, 1);
        let api = Arc::new(FakeApi::with_events(vec![target.clone()]));
        let feed = reconciler(api.clone(), AlarmBook::shared());
        feed.poll_once().await.unwrap();
        let fetches = api.state.lock().fetches;

        let updated = feed.acknowledge(target.id).await.unwrap();
        assert!(updated.acknowledged);
        assert_eq!(updated.notes()[0].text, "Event acknowledged");
        assert_eq!(updated.notes()[0].author, "ops");

        assert!(feed.snapshot().entries[0].acknowledged);
        assert_eq!(api.state.lock().fetches, fetches);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_feed_unchanged() {
        let target = event(Category::Alert, 1);
        let api = Arc::new(FakeApi::with_events(vec![target.clone()]));
        let feed = reconciler(api.clone(), AlarmBook::shared());
        feed.poll_once().await.unwrap();

        api.state.lock().fail_updates = true;
        let result = feed.escalate(target.id).await;
        assert!(matches!(result, Err(FeedError::Api(_))));

        let entry = &feed.snapshot().entries[0];
        assert_eq!(entry.category, Category::Alert);
        assert!(entry.notes().is_empty());
    }

    #[tokio::test]
    async fn test_escalate_and_revert_through_feed() {
        let target = event(Category::Alert, 1);
        let api = Arc::new(FakeApi::with_events(vec![target.clone()]));
        let feed = reconciler(api, AlarmBook::shared());
        feed.poll_once().await.unwrap();

        let escalated = feed.escalate(target.id).await.unwrap();
        assert_eq!(escalated.category, Category::Threat);
        assert_eq!(escalated.original_category(), Some(Category::Alert));

        // Second escalation is a no-op
        let again = feed.escalate(target.id).await.unwrap();
        assert_eq!(again.notes().len(), 1);

        let reverted = feed.revert(target.id).await.unwrap();
        assert_eq!(reverted.category, Category::Alert);
        assert_eq!(reverted.original_category(), None);
        assert_eq!(feed.snapshot().entries[0].category, Category::Alert);
    }

    #[tokio::test]
    async fn test_add_note_and_unknown_id() {
        let target = event(Category::Detect, 1);
        let api = Arc::new(FakeApi::with_events(vec![target.clone()]));
        let feed = reconciler(api, AlarmBook::shared());
        feed.poll_once().await.unwrap();

        let noted = feed.add_note(target.id, "checked the vent").await.unwrap();
        assert_eq!(noted.notes()[0].text, "checked the vent");
        assert_eq!(noted.data["co2"], 900);

        assert!(matches!(
            feed.acknowledge(Uuid::new_v4()).await,
            Err(FeedError::NotInFeed(_))
        ));
    }

    #[tokio::test]
    async fn test_feed_is_bounded() {
        let events: Vec<Event> = (0..20).map(|i| event(Category::Detect, i)).collect();
        let api = Arc::new(FakeApi::with_events(events));
        let feed = EventReconciler::new(api, AlarmBook::shared(), 5, "ops");

        feed.poll_once().await.unwrap();
        assert_eq!(feed.snapshot().entries.len(), 5);
    }
}
