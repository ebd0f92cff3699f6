//! Synthetic alarms raised by the console itself.
//!
//! An alarm is keyed by what failed and where, so a condition that persists
//! across checks updates one alarm instead of piling up new ones. Cleared
//! alarms stay in the book marked inactive so operators can see the resolution.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_pipeline::{Category, Event};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Failure class of a synthetic alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    /// The event store could not be polled
    FetchFailure,
    /// A topic subscription request failed
    SubscriptionFailure,
    /// A sensor went silent
    SensorTimeout,
}

impl AlarmKind {
    /// Topic used when the alarm is shown as an event
    pub fn topic(&self) -> &'static str {
        match self {
            AlarmKind::FetchFailure => "server_unreachable",
            AlarmKind::SubscriptionFailure => "subscription_failure",
            AlarmKind::SensorTimeout => "sensor_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AlarmKey {
    pub kind: AlarmKind,
    /// Topic, sensor id, or endpoint the failure is about
    pub scope: String,
}

impl AlarmKey {
    pub fn fetch_failure(scope: impl Into<String>) -> Self {
        Self {
            kind: AlarmKind::FetchFailure,
            scope: scope.into(),
        }
    }

    pub fn subscription_failure(topic: impl Into<String>) -> Self {
        Self {
            kind: AlarmKind::SubscriptionFailure,
            scope: topic.into(),
        }
    }

    pub fn sensor_timeout(sensor_id: impl Into<String>) -> Self {
        Self {
            kind: AlarmKind::SensorTimeout,
            scope: sensor_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyntheticAlarm {
    pub id: Uuid,
    pub key: AlarmKey,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    /// Last time the condition was observed
    pub updated_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    /// Number of checks that observed the condition
    pub occurrences: u32,
    pub active: bool,
}

impl SyntheticAlarm {
    fn new(key: AlarmKey, message: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            message,
            raised_at: now,
            updated_at: now,
            cleared_at: None,
            occurrences: 1,
            active: true,
        }
    }

    /// The alarm rendered as an ALARM event for the feed
    pub fn to_event(&self) -> Event {
        Event {
            id: self.id,
            category: Category::Alarm,
            topic: self.key.kind.topic().to_string(),
            data: json!({
                "message": self.message,
                "scope": self.key.scope,
                "kind": self.key.kind,
                "active": self.active,
                "occurrences": self.occurrences,
                "raisedAt": self.raised_at,
                "synthetic": true,
            }),
            created_at: self.updated_at,
            acknowledged: false,
        }
    }
}

/// What [`AlarmBook::raise`] did
#[derive(Debug, Clone, PartialEq)]
pub enum Raised {
    Created(SyntheticAlarm),
    Extended(SyntheticAlarm),
}

impl Raised {
    pub fn alarm(&self) -> &SyntheticAlarm {
        match self {
            Raised::Created(alarm) | Raised::Extended(alarm) => alarm,
        }
    }
}

#[derive(Debug, Default)]
pub struct AlarmBook {
    alarms: HashMap<AlarmKey, SyntheticAlarm>,
}

pub type SharedAlarms = Arc<Mutex<AlarmBook>>;

impl AlarmBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedAlarms {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Create an alarm for `key`, or extend the active one
    pub fn raise(&mut self, key: AlarmKey, message: impl Into<String>, now: DateTime<Utc>) -> Raised {
        let message = message.into();
        match self.alarms.get_mut(&key) {
            Some(alarm) if alarm.active => {
                alarm.message = message;
                alarm.updated_at = now;
                alarm.occurrences += 1;
                Raised::Extended(alarm.clone())
            }
            _ => {
                // A resolved alarm that recurs starts a new alarm
                let alarm = SyntheticAlarm::new(key.clone(), message, now);
                self.alarms.insert(key, alarm.clone());
                Raised::Created(alarm)
            }
        }
    }

    /// Mark the alarm inactive. Returns `true` if it was active.
    pub fn clear(&mut self, key: &AlarmKey, now: DateTime<Utc>) -> bool {
        match self.alarms.get_mut(key) {
            Some(alarm) if alarm.active => {
                alarm.active = false;
                alarm.cleared_at = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &AlarmKey) -> Option<&SyntheticAlarm> {
        self.alarms.get(key)
    }

    pub fn is_active(&self, key: &AlarmKey) -> bool {
        self.alarms.get(key).map_or(false, |a| a.active)
    }

    pub fn has_active(&self) -> bool {
        self.alarms.values().any(|a| a.active)
    }

    /// Active alarms, most recently updated first
    pub fn active(&self) -> Vec<SyntheticAlarm> {
        let mut alarms: Vec<_> = self.alarms.values().filter(|a| a.active).cloned().collect();
        alarms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        alarms
    }

    /// Every alarm including resolved ones, most recently updated first
    pub fn all(&self) -> Vec<SyntheticAlarm> {
        let mut alarms: Vec<_> = self.alarms.values().cloned().collect();
        alarms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        alarms
    }
}
