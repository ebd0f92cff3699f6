//! Process-local storage backend.
//!
//! Used when `storage.backend = "memory"` and by the crate's tests. Nothing
//! survives a restart.

use crate::error::{StoreError, StoreResult};
use crate::event_store::{sort_newest_first, EventQuery, EventStore, RawMessage};
use crate::topic_registry::{validate_topic_name, Registration, TopicRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use relay_pipeline::{Event, EventPatch, ValidationError};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    topics: RwLock<BTreeSet<String>>,
    messages: RwLock<Vec<RawMessage>>,
    events: RwLock<HashMap<Uuid, Event>>,
    fail_raw: AtomicBool,
    fail_events: AtomicBool,
    fail_unregister: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make raw appends fail until reset
    #[cfg(test)]
    pub fn fail_raw_writes(&self, fail: bool) {
        self.fail_raw.store(fail, Ordering::SeqCst);
    }

    /// Make event inserts fail until reset
    #[cfg(test)]
    pub fn fail_event_writes(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    /// Make topic removals fail until reset
    #[cfg(test)]
    pub fn fail_unregisters(&self, fail: bool) {
        self.fail_unregister.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool, what: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Storage(format!("{} write rejected", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl TopicRegistry for MemoryStore {
    async fn register(&self, topic: &str) -> StoreResult<Registration> {
        validate_topic_name(topic)?;
        let created = self.topics.write().insert(topic.to_string());
        Ok(Registration { created })
    }

    async fn unregister(&self, topic: &str) -> StoreResult<()> {
        self.check(&self.fail_unregister, "topic removal")?;
        self.topics.write().remove(topic);
        Ok(())
    }

    async fn contains(&self, topic: &str) -> StoreResult<bool> {
        Ok(self.topics.read().contains(topic))
    }

    async fn list(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self.topics.read().clone())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_raw(
        &self,
        topic: &str,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> StoreResult<Uuid> {
        self.check(&self.fail_raw, "raw message")?;

        let id = Uuid::new_v4();
        self.messages.write().push(RawMessage {
            id,
            topic: topic.to_string(),
            payload: payload.clone(),
            received_at,
        });
        Ok(id)
    }

    async fn raw_messages(&self, topic: &str, limit: Option<i64>) -> StoreResult<Vec<RawMessage>> {
        let mut messages: Vec<RawMessage> = self
            .messages
            .read()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        if let Some(limit) = limit {
            messages.truncate(limit.max(0) as usize);
        }
        Ok(messages)
    }

    async fn insert(&self, event: &Event) -> StoreResult<()> {
        self.check(&self.fail_events, "event")?;

        if !event.category.is_known() {
            return Err(ValidationError::InvalidCategory(event.category.as_str().to_string()).into());
        }
        self.events.write().insert(event.id, event.clone());
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> StoreResult<Vec<Event>> {
        let mut events: Vec<Event> = self
            .events
            .read()
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        sort_newest_first(&mut events);
        if let Some(limit) = query.limit {
            events.truncate(limit.max(0) as usize);
        }
        Ok(events)
    }

    async fn update(&self, id: Uuid, patch: &EventPatch) -> StoreResult<Event> {
        patch.validate()?;

        let mut events = self.events.write();
        let event = events
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("event {}", id)))?;
        event.apply(patch);
        Ok(event.clone())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
