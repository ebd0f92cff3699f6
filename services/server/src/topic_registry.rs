//! Durable set of topic names the relay has committed to ingest.

use crate::error::StoreResult;
use async_trait::async_trait;
use relay_pipeline::ValidationError;
use serde::Serialize;
use std::collections::BTreeSet;

/// Longest topic name accepted by the bus
const MAX_TOPIC_LEN: usize = 249;

/// Outcome of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Registration {
    /// `false` when the topic was already registered
    pub created: bool,
}

#[async_trait]
pub trait TopicRegistry: Send + Sync {
    /// Idempotent. Registering an existing name returns `created: false`.
    async fn register(&self, topic: &str) -> StoreResult<Registration>;

    /// Remove a registration. Only used to undo a registration whose bus
    /// subscription failed.
    async fn unregister(&self, topic: &str) -> StoreResult<()>;

    async fn contains(&self, topic: &str) -> StoreResult<bool>;

    async fn list(&self) -> StoreResult<BTreeSet<String>>;
}

/// Topic names must be usable as bus topics
pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::MissingField("topic".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::InvalidValue {
            field: "topic".to_string(),
            message: format!("longer than {} characters", MAX_TOPIC_LEN),
        });
    }
    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(ValidationError::InvalidValue {
            field: "topic".to_string(),
            message: format!("illegal character {:?}", c),
        });
    }
    Ok(())
}

/// Registered topics minus the administrative names never ingested
pub async fn resumable_topics(
    registry: &dyn TopicRegistry,
    excluded: &[String],
) -> StoreResult<Vec<String>> {
    let topics = registry.list().await?;
    Ok(topics
        .into_iter()
        .filter(|t| !excluded.iter().any(|e| e == t))
        .collect())
}
