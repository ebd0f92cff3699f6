//! Event store query/update surface.
//!
//! The store owns persistence of derived events and of the raw payloads they
//! came from. Raw messages are a generic `(topic, payload)` collection; no
//! per-topic schema exists at the storage layer.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_pipeline::{Event, EventPatch, NewEvent};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Filters for event reads. Results are always newest first.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Exact event id
    pub id: Option<Uuid>,
    /// Topic the event belongs to
    pub topic: Option<String>,
    /// Strictly earlier than this instant
    pub before: Option<DateTime<Utc>>,
    /// Strictly later than this instant
    pub after: Option<DateTime<Utc>>,
    /// Maximum number of results
    pub limit: Option<i64>,
}

impl EventQuery {
    pub fn by_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Default::default()
        }
    }

    pub fn before(timestamp: DateTime<Utc>) -> Self {
        Self {
            before: Some(timestamp),
            ..Default::default()
        }
    }

    pub fn after(timestamp: DateTime<Utc>) -> Self {
        Self {
            after: Some(timestamp),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: Option<i64>) -> Self {
        self.limit = limit.filter(|l| *l > 0);
        self
    }

    /// In-process evaluation of the filter
    pub fn matches(&self, event: &Event) -> bool {
        self.id.map_or(true, |id| event.id == id)
            && self.topic.as_deref().map_or(true, |t| event.topic == t)
            && self.before.map_or(true, |ts| event.created_at < ts)
            && self.after.map_or(true, |ts| event.created_at > ts)
    }
}

/// A raw payload as received from the bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a raw payload to the generic message collection
    async fn append_raw(
        &self,
        topic: &str,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> StoreResult<Uuid>;

    /// Raw payloads for one topic, newest first
    async fn raw_messages(&self, topic: &str, limit: Option<i64>) -> StoreResult<Vec<RawMessage>>;

    /// Persist a fully formed event
    async fn insert(&self, event: &Event) -> StoreResult<()>;

    /// Filtered read, sorted descending by `createdAt`
    async fn query(&self, query: &EventQuery) -> StoreResult<Vec<Event>>;

    /// Apply a narrow update and return the stored result
    async fn update(&self, id: Uuid, patch: &EventPatch) -> StoreResult<Event>;

    /// Cheap connectivity check
    async fn ping(&self) -> StoreResult<()>;

    /// Validate and persist an event created through the write API
    async fn create(&self, new: NewEvent) -> StoreResult<Event> {
        new.validate()?;
        let event = Event::from_new(new);
        self.insert(&event).await?;
        Ok(event)
    }

    /// Single event by id
    async fn get(&self, id: Uuid) -> StoreResult<Event> {
        let query = EventQuery {
            id: Some(id),
            limit: Some(1),
            ..Default::default()
        };
        self.query(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("event {}", id)))
    }
}

/// Newest first, ties broken by id so ordering is stable
pub fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Duration;
    use relay_pipeline::{Category, ValidationError};
    use serde_json::json;

    fn event_at(topic: &str, minutes_ago: i64) -> Event {
        let mut event = Event::detect(topic, json!({"n": minutes_ago}));
        event.created_at = Utc::now() - Duration::minutes(minutes_ago);
        event
    }

    #[tokio::test]
    async fn test_query_sorts_newest_first() {
        let store = MemoryStore::new();
        for minutes in [30, 5, 60, 10] {
            store.insert(&event_at("gas", minutes)).await.unwrap();
        }

        let events = store.query(&EventQuery::default()).await.unwrap();
        let order: Vec<i64> = events.iter().map(|e| e.data["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![5, 10, 30, 60]);
    }

    #[tokio::test]
    async fn test_query_by_topic_and_time() {
        let store = MemoryStore::new();
        store.insert(&event_at("gas", 30)).await.unwrap();
        store.insert(&event_at("gas", 5)).await.unwrap();
        store.insert(&event_at("motion", 5)).await.unwrap();

        let gas = store.query(&EventQuery::by_topic("gas")).await.unwrap();
        assert_eq!(gas.len(), 2);

        let cutoff = Utc::now() - Duration::minutes(15);
        let recent = store.query(&EventQuery::after(cutoff)).await.unwrap();
        assert_eq!(recent.len(), 2);
        let older = store.query(&EventQuery::before(cutoff)).await.unwrap();
        assert_eq!(older.len(), 1);

        let limited = store
            .query(&EventQuery::default().with_limit(Some(1)))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_event_is_not_found() {
        let store = MemoryStore::new();
        let result = store.get(Uuid::new_v4()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_category() {
        let store = MemoryStore::new();
        let result = store
            .create(NewEvent::new(Category::Unknown, "gas", json!({})))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Validation(ValidationError::InvalidCategory(_)))
        ));
        assert!(store.query(&EventQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_identity_and_timestamp() {
        let store = MemoryStore::new();
        let created = store
            .create(NewEvent::new(Category::Alert, "gas", json!({"co2": 1200})))
            .await
            .unwrap();

        let patch = EventPatch::escalate(&created, "ops").unwrap();
        let updated = store.update(created.id, &patch).await.unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.category, Category::Threat);
        assert_eq!(updated.original_category(), Some(Category::Alert));
    }

    #[tokio::test]
    async fn test_update_rejects_unknown_category() {
        let store = MemoryStore::new();
        let created = store
            .create(NewEvent::new(Category::Alert, "gas", json!({})))
            .await
            .unwrap();

        let patch = EventPatch {
            category: Some(Category::Unknown),
            ..Default::default()
        };
        assert!(matches!(
            store.update(created.id, &patch).await,
            Err(StoreError::Validation(_))
        ));
    }
}
