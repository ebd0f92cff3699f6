//! Relay Pipeline - bus plumbing and shared event model
//!
//! This library is shared by the relay server and the operator console. It
//! provides:
//!
//! - The [`Event`] wire model with categories, notes and escalation patches
//! - The [`BusConnector`] seam over the message bus, with an in-process
//!   [`MemoryBus`] and (feature `kafka`) a Kafka-backed connector
//! - A Kafka publisher for pushing sensor payloads onto the bus
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_pipeline::{BusConnector, MemoryBus};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bus = MemoryBus::new();
//!     bus.subscribe("gas").await?;
//!     bus.publish("gas", br#"{"co2": 900}"#.to_vec());
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
#[cfg(feature = "kafka")]
pub mod consumer;
pub mod event;
#[cfg(feature = "kafka")]
pub mod producer;

pub use bus::{BusConnector, BusError, IncomingMessage, MemoryBus};
pub use config::{ConfigError, ConsumerConfig, KafkaConfig, SaslConfig, SecurityProtocol, SslConfig};
#[cfg(feature = "kafka")]
pub use consumer::KafkaConnector;
pub use event::{Category, Event, EventPatch, NewEvent, Note, ValidationError};
#[cfg(feature = "kafka")]
pub use producer::{BusPublisher, DeliveryResult};

/// Async trait for bus connectors (re-export for convenience)
pub use async_trait::async_trait;
