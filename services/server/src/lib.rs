//! Relay Server
//!
//! Topic registry, telemetry ingestion and event store for the
//! situational-awareness relay. Operators ask the server to subscribe to a bus
//! topic; from then on every JSON payload on that topic is recorded as a raw
//! message and as a `DETECT` event, and the HTTP API serves those events back
//! for acknowledgment and escalation.
//!
//! ## Architecture
//!
//! ```text
//! Message Bus                                     PostgreSQL / memory
//! ┌──────────────┐    ┌──────────────┐           ┌──────────────┐
//! │ sensor       │───▶│ Bus          │           │ topics       │
//! │ topics       │    │ Connector    │           │ messages     │
//! └──────────────┘    └──────────────┘           │ events       │
//!                            │                   └──────────────┘
//!                            ▼                          ▲
//!                     ┌──────────────┐                  │
//!                     │ Ingestion    │──────────────────┤
//!                     │ Pipeline     │                  │
//!                     └──────────────┘                  │
//!                            ▲                          │
//!                            │ subscribe                │
//!                     ┌──────────────┐                  │
//!                     │ HTTP API     │──────────────────┘
//!                     └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod event_store;
pub mod ingestion;
pub mod memory;
pub mod postgres;
pub mod topic_registry;

pub use api::{create_router, start_api_server, AppState};
pub use config::{Config, StorageBackend};
pub use error::{StoreError, StoreResult};
pub use event_store::{EventQuery, EventStore, RawMessage};
pub use ingestion::{IngestionPipeline, ResumeReport, SubscribeOutcome};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use topic_registry::{Registration, TopicRegistry};
