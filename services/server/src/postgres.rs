use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};
use crate::event_store::{EventQuery, EventStore, RawMessage};
use crate::topic_registry::{validate_topic_name, Registration, TopicRegistry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_pipeline::{Category, Event, EventPatch};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Row shape of the `events` table
#[derive(Debug, Clone, FromRow)]
struct EventRow {
    id: Uuid,
    category: String,
    topic: String,
    data: Value,
    created_at: DateTime<Utc>,
    acknowledged: bool,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id,
            // The table constraint only admits the four known values
            category: row.category.parse().unwrap_or(Category::Unknown),
            topic: row.topic,
            data: row.data,
            created_at: row.created_at,
            acknowledged: row.acknowledged,
        }
    }
}

/// Topic registry and event store backed by PostgreSQL
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl TopicRegistry for PgStore {
    #[instrument(skip(self))]
    async fn register(&self, topic: &str) -> StoreResult<Registration> {
        validate_topic_name(topic)?;

        let result = sqlx::query(
            r#"
            INSERT INTO topics (topic_name)
            VALUES ($1)
            ON CONFLICT (topic_name) DO NOTHING
            "#,
        )
        .bind(topic)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        debug!(topic = %topic, created, "Topic registration");

        Ok(Registration { created })
    }

    async fn unregister(&self, topic: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM topics WHERE topic_name = $1")
            .bind(topic)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn contains(&self, topic: &str) -> StoreResult<bool> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT topic_name FROM topics WHERE topic_name = $1")
                .bind(topic)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn list(&self) -> StoreResult<BTreeSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT topic_name FROM topics")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn append_raw(
        &self,
        topic: &str,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO messages (id, topic, payload, received_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(topic)
        .bind(payload)
        .bind(received_at)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn raw_messages(&self, topic: &str, limit: Option<i64>) -> StoreResult<Vec<RawMessage>> {
        let rows: Vec<(Uuid, String, Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, topic, payload, received_at
            FROM messages
            WHERE topic = $1
            ORDER BY received_at DESC
            LIMIT $2
            "#,
        )
        .bind(topic)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, topic, payload, received_at)| RawMessage {
                id,
                topic,
                payload,
                received_at,
            })
            .collect())
    }

    #[instrument(skip(self, event), fields(event_id = %event.id, topic = %event.topic))]
    async fn insert(&self, event: &Event) -> StoreResult<()> {
        if !event.category.is_known() {
            return Err(relay_pipeline::ValidationError::InvalidCategory(
                event.category.as_str().to_string(),
            )
            .into());
        }

        sqlx::query(
            r#"
            INSERT INTO events (id, category, topic, data, created_at, acknowledged)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.category.as_str())
        .bind(&event.topic)
        .bind(&event.data)
        .bind(event.created_at)
        .bind(event.acknowledged)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn query(&self, query: &EventQuery) -> StoreResult<Vec<Event>> {
        let mut sql = String::from(
            r#"
            SELECT id, category, topic, data, created_at, acknowledged
            FROM events
            WHERE 1=1
            "#,
        );

        let mut param_count = 0;

        if query.id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND id = ${}", param_count));
        }

        if query.topic.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND topic = ${}", param_count));
        }

        if query.before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at < ${}", param_count));
        }

        if query.after.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at > ${}", param_count));
        }

        sql.push_str(" ORDER BY created_at DESC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${}", param_count));
        }

        let mut query_builder = sqlx::query_as::<_, EventRow>(&sql);

        if let Some(id) = query.id {
            query_builder = query_builder.bind(id);
        }
        if let Some(ref topic) = query.topic {
            query_builder = query_builder.bind(topic);
        }
        if let Some(before) = query.before {
            query_builder = query_builder.bind(before);
        }
        if let Some(after) = query.after {
            query_builder = query_builder.bind(after);
        }
        if let Some(limit) = query.limit {
            query_builder = query_builder.bind(limit);
        }

        let rows = query_builder.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Event::from).collect())
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: Uuid, patch: &EventPatch) -> StoreResult<Event> {
        patch.validate()?;

        let row = sqlx::query_as::<_, EventRow>(
            r#"
            UPDATE events SET
                acknowledged = COALESCE($2::boolean, acknowledged),
                category = COALESCE($3::text, category),
                data = COALESCE($4::jsonb, data)
            WHERE id = $1
            RETURNING id, category, topic, data, created_at, acknowledged
            "#,
        )
        .bind(id)
        .bind(patch.acknowledged)
        .bind(patch.category.map(|c| c.as_str()))
        .bind(patch.data.clone())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Event::from)
            .ok_or_else(|| StoreError::NotFound(format!("event {}", id)))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_conversion() {
        let row = EventRow {
            id: Uuid::new_v4(),
            category: "ALARM".to_string(),
            topic: "sensor_timeout".to_string(),
            data: json!({"sensorId": "S1"}),
            created_at: Utc::now(),
            acknowledged: false,
        };

        let event = Event::from(row.clone());
        assert_eq!(event.id, row.id);
        assert_eq!(event.category, Category::Alarm);
        assert_eq!(event.sensor_id(), Some("S1"));
    }
}
