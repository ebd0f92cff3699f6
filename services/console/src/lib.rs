//! Relay Console
//!
//! Client-side reconciliation for the relay operator console. The console
//! polls the relay server, merges what it finds with alarms it raises itself
//! (server unreachable, subscription rejected, sensor silent) and publishes a
//! bounded, prioritized view through `tokio::sync::watch` channels.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────┐
//!                │ Session          │  cancellation + task tracking
//!                └──────────────────┘
//!                   │      │      │
//!        ┌──────────┘      │      └───────────┐
//!        ▼                 ▼                  ▼
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ Subscription │  │ Event        │  │ Sensor       │
//! │ Manager      │  │ Reconciler   │  │ Reconciler   │
//! └──────────────┘  └──────────────┘  └──────────────┘
//!        │   └──── AlarmBook ───┘             │
//!        ▼                 ▼                  ▼
//!                   RelayApi (HTTP)
//! ```

pub mod alarms;
pub mod api_client;
pub mod config;
pub mod event_feed;
pub mod feed;
pub mod sensor_feed;
pub mod session;
pub mod subscriptions;

pub use alarms::{AlarmBook, AlarmKey, AlarmKind, Raised, SharedAlarms, SyntheticAlarm};
pub use api_client::{ApiError, HttpRelayApi, RelayApi};
pub use config::ConsoleConfig;
pub use event_feed::{EventReconciler, FeedError, FeedSnapshot};
pub use sensor_feed::{SensorReconciler, SensorSnapshot, SensorStatus};
pub use session::Session;
pub use subscriptions::{SubscriptionManager, SubscriptionStatus};
