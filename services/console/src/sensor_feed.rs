//! Sensor reconciliation engine.
//!
//! Keeps the newest status event per configured sensor and watches for
//! sensors that stop reporting. Status rows are keyed by the sensor id carried
//! in the payload; a newer event supersedes the older one entirely.

use crate::alarms::{AlarmBook, AlarmKey, Raised, SyntheticAlarm};
use crate::api_client::{ApiError, RelayApi};
use crate::config::SensorConfig;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use relay_pipeline::{Category, Event, EventPatch, NewEvent};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const PLACEHOLDER_STATUS: &str = "No data available";
pub const UNKNOWN_SENSOR_TYPE: &str = "Unknown";
/// Topic timeout alarms are persisted under
pub const TIMEOUT_TOPIC: &str = "sensor_timeout";

/// One row of the sensor view
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorStatus {
    pub sensor_id: String,
    pub sensor_type: String,
    pub status: String,
    pub last_update: Option<DateTime<Utc>>,
    pub event_id: Option<Uuid>,
    pub data: Value,
    pub timed_out: bool,
}

impl SensorStatus {
    fn placeholder(sensor_id: &str) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            sensor_type: UNKNOWN_SENSOR_TYPE.to_string(),
            status: PLACEHOLDER_STATUS.to_string(),
            last_update: None,
            event_id: None,
            data: Value::Null,
            timed_out: false,
        }
    }

    fn from_event(sensor_id: &str, event: &Event, timed_out: bool) -> Self {
        let sensor_type = event
            .data
            .get("sensorType")
            .or_else(|| event.data.get("sensor_type"))
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_SENSOR_TYPE)
            .to_string();

        let status = match event.data.get("status") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "Reporting".to_string(),
            Some(other) => other.to_string(),
        };

        Self {
            sensor_id: sensor_id.to_string(),
            sensor_type,
            status,
            last_update: Some(event.created_at),
            event_id: Some(event.id),
            data: event.data.clone(),
            timed_out,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.event_id.is_none()
    }
}

/// Published view of the sensors
/// Published view of the sensors
#[derive(Debug, Clone, Default)]
pub struct SensorSnapshot {
    /// One row per configured sensor, in configuration order
    pub sensors: Vec<SensorStatus>,
    /// Timeout and poll-failure alarms including resolved ones
    pub alarms: Vec<SyntheticAlarm>,
    pub has_active_alarms: bool,
}

#[derive(Default)]
struct SensorState {
    latest: HashMap<String, Event>,
    last_seen: HashMap<String, DateTime<Utc>>,
    alarms: AlarmBook,
    /// Server-side timeout event per sensor, until it is marked resolved
    persisted: HashMap<String, Event>,
}

pub struct SensorReconciler {
    api: Arc<dyn RelayApi>,
    status_topic: String,
    sensor_ids: Vec<String>,
    silence_threshold: Duration,
    state: Mutex<SensorState>,
    snapshot_tx: watch::Sender<SensorSnapshot>,
}

impl SensorReconciler {
    pub fn new(api: Arc<dyn RelayApi>, config: &SensorConfig) -> Self {
        let reconciler = Self {
            api,
            status_topic: config.status_topic.clone(),
            sensor_ids: config.sensor_ids.clone(),
            silence_threshold: config.silence_threshold(),
            state: Mutex::new(SensorState::default()),
            snapshot_tx: watch::channel(SensorSnapshot::default()).0,
        };
        // Configured sensors show up as placeholders before the first poll
        reconciler.publish();
        reconciler
    }

    pub fn subscribe(&self) -> watch::Receiver<SensorSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn has_active_alarms(&self) -> bool {
        self.state.lock().alarms.has_active()
    }

    /// Fetch the status topic and fold it in. State is kept on failure and the
    /// failure is raised as an alarm until a poll succeeds again.
    pub async fn poll_once(&self) -> Result<usize, ApiError> {
        let result = self.api.fetch_topic_events(&self.status_topic).await;
        let now = Utc::now();
        let key = AlarmKey::fetch_failure(self.status_topic.as_str());

        let outcome = match result {
            Ok(events) => {
                if self.state.lock().alarms.clear(&key, now) {
                    info!(topic = %self.status_topic, "Sensor status reachable again");
                }
                Ok(self.ingest(&events, now))
            }
            Err(e) => {
                let raised = self.state.lock().alarms.raise(
                    key,
                    format!("Unable to fetch sensor status: {}", e),
                    now,
                );
                warn!(
                    topic = %self.status_topic,
                    error = %e,
                    occurrences = raised.alarm().occurrences,
                    "Sensor status poll failed"
                );
                Err(e)
            }
        };

        self.resolve_recovered(now).await;
        self.publish();
        outcome
    }

    /// Fold status events into the per-sensor view. Returns how many sensors
    /// reported something newer than before.
    ///
    /// The row for a sensor follows the newest event; a newer copy of the same
    /// event (notes, acknowledgment, escalation) replaces the cached one.
    pub fn ingest(&self, events: &[Event], now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let mut updated = 0;

        for event in events {
            // Alarm events say nothing about the sensor being alive
            if event.category == Category::Alarm {
                continue;
            }
            let Some(sensor_id) = event.sensor_id() else {
                continue;
            };
            if !self.sensor_ids.iter().any(|s| s == sensor_id) {
                continue;
            }

            let replace = state.latest.get(sensor_id).map_or(true, |current| {
                current.id == event.id || event.created_at > current.created_at
            });
            if replace {
                state.latest.insert(sensor_id.to_string(), event.clone());
            }

            let advanced = state
                .last_seen
                .get(sensor_id)
                .map_or(true, |seen| event.created_at > *seen);
            if advanced {
                updated += 1;
                state
                    .last_seen
                    .insert(sensor_id.to_string(), event.created_at);
                if state.alarms.clear(&AlarmKey::sensor_timeout(sensor_id), now) {
                    info!(sensor_id = %sensor_id, "Sensor reporting again");
                }
            }
        }

        updated
    }

    /// Raise or extend a timeout alarm for every sensor silent longer than the
    /// threshold. New alarms are also written to the relay as ALARM events,
    /// reusing an open one left by an earlier session.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<Raised> {
        let raised: Vec<Raised> = {
            let mut state = self.state.lock();
            let mut raised = Vec::new();

            for sensor_id in &self.sensor_ids {
                // Sensors that never reported cannot go silent
                let Some(last_seen) = state.last_seen.get(sensor_id).copied() else {
                    continue;
                };
                let silent = now - last_seen;
                if silent <= self.silence_threshold {
                    continue;
                }

                let message = format!(
                    "Sensor {} silent for {}s (last seen {})",
                    sensor_id,
                    silent.num_seconds(),
                    last_seen.to_rfc3339()
                );
                raised.push(
                    state
                        .alarms
                        .raise(AlarmKey::sensor_timeout(sensor_id.as_str()), message, now),
                );
            }

            raised
        };

        for outcome in &raised {
            match outcome {
                Raised::Created(alarm) => self.persist_timeout(alarm).await,
                Raised::Extended(alarm) => {
                    debug!(
                        sensor_id = %alarm.key.scope,
                        occurrences = alarm.occurrences,
                        "Sensor still silent"
                    );
                }
            }
        }

        self.resolve_recovered(now).await;
        self.publish();
        raised
    }

    async fn persist_timeout(&self, alarm: &SyntheticAlarm) {
        let sensor_id = alarm.key.scope.as_str();
        warn!(sensor_id = %sensor_id, message = %alarm.message, "Sensor timed out");

        let event = match self.open_timeout_event(sensor_id).await {
            Some(existing) => {
                debug!(sensor_id = %sensor_id, event_id = %existing.id, "Reusing open timeout alarm");
                existing
            }
            None => {
                let new = NewEvent::new(
                    Category::Alarm,
                    TIMEOUT_TOPIC,
                    json!({
                        "sensorId": sensor_id,
                        "message": alarm.message,
                        "alarmId": alarm.id,
                        "raisedAt": alarm.raised_at,
                        "active": true,
                    }),
                );
                match self.api.create_event(&new).await {
                    Ok(created) => created,
                    Err(e) => {
                        warn!(
                            sensor_id = %sensor_id,
                            error = %e,
                            "Failed to persist sensor timeout alarm"
                        );
                        return;
                    }
                }
            }
        };

        self.state
            .lock()
            .persisted
            .insert(sensor_id.to_string(), event);
    }

    /// Newest unresolved timeout event the relay holds for `sensor_id`
    async fn open_timeout_event(&self, sensor_id: &str) -> Option<Event> {
        let events = match self.api.fetch_topic_events(TIMEOUT_TOPIC).await {
            Ok(events) => events,
            Err(e) => {
                debug!(error = %e, "Could not look up open timeout alarms");
                return None;
            }
        };

        events
            .into_iter()
            .filter(|e| e.category == Category::Alarm && e.sensor_id() == Some(sensor_id))
            .filter(|e| e.data.get("active").and_then(Value::as_bool).unwrap_or(true))
            .max_by_key(|e| e.created_at)
    }

    /// Mark server-side timeout events resolved once their local alarm has
    /// cleared. Failed updates stay queued for the next cycle.
    async fn resolve_recovered(&self, now: DateTime<Utc>) {
        let recovered: Vec<(String, Event)> = {
            let state = self.state.lock();
            state
                .persisted
                .iter()
                .filter(|(id, _)| {
                    !state
                        .alarms
                        .is_active(&AlarmKey::sensor_timeout(id.as_str()))
                })
                .map(|(id, event)| (id.clone(), event.clone()))
                .collect()
        };

        if recovered.is_empty() {
            return;
        }

        // Patch on top of the server's current copy so operator notes survive
        let current: HashMap<Uuid, Event> = match self.api.fetch_topic_events(TIMEOUT_TOPIC).await {
            Ok(events) => events.into_iter().map(|e| (e.id, e)).collect(),
            Err(_) => HashMap::new(),
        };

        for (sensor_id, cached) in recovered {
            let event = current.get(&cached.id).cloned().unwrap_or(cached);
            let mut data = match event.data {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            data.insert("active".to_string(), Value::Bool(false));
            data.insert("resolvedAt".to_string(), json!(now));
            let patch = EventPatch {
                data: Some(Value::Object(data)),
                ..Default::default()
            };

            match self.api.update_event(event.id, &patch).await {
                Ok(_) => {
                    info!(sensor_id = %sensor_id, event_id = %event.id, "Timeout alarm resolved");
                    self.state.lock().persisted.remove(&sensor_id);
                }
                Err(e) => {
                    warn!(
                        sensor_id = %sensor_id,
                        error = %e,
                        "Failed to resolve timeout alarm, will retry"
                    );
                }
            }
        }
    }

    fn publish(&self) {
        let snapshot = {
            let state = self.state.lock();
            let sensors = self
                .sensor_ids
                .iter()
                .map(|id| match state.latest.get(id) {
                    Some(event) => SensorStatus::from_event(
                        id,
                        event,
                        state.alarms.is_active(&AlarmKey::sensor_timeout(id.as_str())),
                    ),
                    None => SensorStatus::placeholder(id),
                })
                .collect();

            SensorSnapshot {
                sensors,
                alarms: state.alarms.all(),
                has_active_alarms: state.alarms.has_active(),
            }
        };

        self.snapshot_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::fake::FakeApi;

    fn config(ids: &[&str]) -> SensorConfig {
        SensorConfig {
            sensor_ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn status(sensor_id: &str, minutes_ago: i64, status: &str) -> Event {
        let mut event = Event::detect(
            "sensor_status",
            json!({"sensorId": sensor_id, "sensorType": "Gas", "status": status}),
        );
        event.created_at = Utc::now() - Duration::minutes(minutes_ago);
        event
    }

    #[tokio::test]
    async fn test_latest_event_per_sensor_with_placeholders() {
        let api = Arc::new(FakeApi::with_events(vec![
            status("S1", 10, "old"),
            status("S1", 1, "new"),
            status("S2", 3, "ok"),
            status("S9", 1, "not configured"),
        ]));
        let sensors = SensorReconciler::new(api, &config(&["S1", "S2", "S3"]));

        sensors.poll_once().await.unwrap();
        let snapshot = sensors.snapshot();

        assert_eq!(snapshot.sensors.len(), 3);
        assert_eq!(snapshot.sensors[0].status, "new");
        assert_eq!(snapshot.sensors[0].sensor_type, "Gas");
        assert_eq!(snapshot.sensors[1].status, "ok");

        let placeholders: Vec<_> = snapshot
            .sensors
            .iter()
            .filter(|s| s.sensor_id == "S3")
            .collect();
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0].status, PLACEHOLDER_STATUS);
        assert_eq!(placeholders[0].sensor_type, UNKNOWN_SENSOR_TYPE);
        assert!(placeholders[0].is_placeholder());
    }

    #[tokio::test]
    async fn test_placeholders_before_first_poll() {
        let sensors = SensorReconciler::new(Arc::new(FakeApi::default()), &config(&["S1"]));
        let snapshot = sensors.snapshot();
        assert_eq!(snapshot.sensors.len(), 1);
        assert_eq!(snapshot.sensors[0].status, PLACEHOLDER_STATUS);
        assert!(!snapshot.has_active_alarms);
    }

    #[tokio::test]
    async fn test_snake_case_sensor_id_is_accepted() {
        let mut event = Event::detect("sensor_status", json!({"sensor_id": "S1", "status": "ok"}));
        event.created_at = Utc::now();
        let api = Arc::new(FakeApi::with_events(vec![event]));
        let sensors = SensorReconciler::new(api, &config(&["S1"]));

        sensors.poll_once().await.unwrap();
        assert_eq!(sensors.snapshot().sensors[0].status, "ok");
    }

    #[tokio::test]
    async fn test_timeout_created_once_then_extended() {
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 10, "ok")]));
        let sensors = SensorReconciler::new(api.clone(), &config(&["S1"]));
        sensors.poll_once().await.unwrap();

        let now = Utc::now();
        let first = sensors.check_timeouts(now).await;
        assert!(matches!(first.as_slice(), [Raised::Created(_)]));

        let second = sensors.check_timeouts(now + Duration::seconds(60)).await;
        assert!(matches!(second.as_slice(), [Raised::Extended(_)]));
        assert_eq!(second[0].alarm().id, first[0].alarm().id);

        let created = api.state.lock().created.clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].category, Category::Alarm);
        assert_eq!(created[0].topic, TIMEOUT_TOPIC);
        assert_eq!(created[0].data["sensorId"], "S1");

        let snapshot = sensors.snapshot();
        assert!(snapshot.has_active_alarms);
        assert!(snapshot.sensors[0].timed_out);
        assert_eq!(snapshot.alarms.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_status_clears_timeout() {
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 10, "ok")]));
        let sensors = SensorReconciler::new(api.clone(), &config(&["S1"]));
        sensors.poll_once().await.unwrap();
        sensors.check_timeouts(Utc::now()).await;
        assert!(sensors.has_active_alarms());

        api.state.lock().events.push(status("S1", 0, "back"));
        sensors.poll_once().await.unwrap();

        assert!(!sensors.has_active_alarms());
        let snapshot = sensors.snapshot();
        assert_eq!(snapshot.sensors[0].status, "back");
        assert!(!snapshot.sensors[0].timed_out);
        assert_eq!(snapshot.alarms.len(), 1);
        assert!(!snapshot.alarms[0].active);
    }

    #[tokio::test]
    async fn test_repeated_old_history_does_not_clear_timeout() {
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 10, "ok")]));
        let sensors = SensorReconciler::new(api, &config(&["S1"]));
        sensors.poll_once().await.unwrap();
        sensors.check_timeouts(Utc::now()).await;

        sensors.poll_once().await.unwrap();
        assert!(sensors.has_active_alarms());
    }

    #[tokio::test]
    async fn test_alarm_events_do_not_count_as_status() {
        let mut alarm = status("S1", 0, "silent");
        alarm.category = Category::Alarm;
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 10, "ok"), alarm]));
        let sensors = SensorReconciler::new(api, &config(&["S1"]));

        sensors.poll_once().await.unwrap();
        assert_eq!(sensors.snapshot().sensors[0].status, "ok");
        assert_eq!(sensors.check_timeouts(Utc::now()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_silent_or_unseen_sensors() {
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 1, "ok")]));
        let sensors = SensorReconciler::new(api.clone(), &config(&["S1", "S2"]));
        sensors.poll_once().await.unwrap();

        // S1 is within the threshold and S2 never reported
        assert!(sensors.check_timeouts(Utc::now()).await.is_empty());
        assert!(api.state.lock().created.is_empty());
    }

    #[tokio::test]
    async fn test_poll_failure_keeps_rows() {
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 1, "ok")]));
        let sensors = SensorReconciler::new(api.clone(), &config(&["S1"]));
        sensors.poll_once().await.unwrap();

        api.state.lock().unreachable = true;
        assert!(sensors.poll_once().await.is_err());
        assert_eq!(sensors.snapshot().sensors[0].status, "ok");
    }

    #[tokio::test]
    async fn test_poll_failure_raises_one_alarm_until_reachable() {
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 1, "ok")]));
        let cfg = config(&["S1"]);
        let sensors = SensorReconciler::new(api.clone(), &cfg);
        let key = AlarmKey::fetch_failure(cfg.status_topic.as_str());

        api.state.lock().unreachable = true;
        for _ in 0..3 {
            assert!(sensors.poll_once().await.is_err());
        }

        let snapshot = sensors.snapshot();
        assert!(snapshot.has_active_alarms);
        let failures: Vec<_> = snapshot.alarms.iter().filter(|a| a.key == key).collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].active);
        assert_eq!(failures[0].occurrences, 3);

        api.state.lock().unreachable = false;
        sensors.poll_once().await.unwrap();

        let snapshot = sensors.snapshot();
        assert!(!snapshot.has_active_alarms);
        assert!(snapshot.alarms.iter().any(|a| a.key == key && !a.active));
    }

    #[tokio::test]
    async fn test_updated_copy_of_same_event_replaces_row() {
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 1, "ok")]));
        let sensors = SensorReconciler::new(api.clone(), &config(&["S1"]));
        sensors.poll_once().await.unwrap();
        assert!(sensors.snapshot().sensors[0].data.get("notes").is_none());

        {
            let mut state = api.state.lock();
            let patch = EventPatch::add_note(&state.events[0], "checked on site", "ops");
            state.events[0].apply(&patch);
        }
        sensors.poll_once().await.unwrap();

        let snapshot = sensors.snapshot();
        assert_eq!(snapshot.sensors[0].status, "ok");
        assert_eq!(snapshot.sensors[0].data["notes"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_recovery_resolves_persisted_timeout() {
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 10, "ok")]));
        let sensors = SensorReconciler::new(api.clone(), &config(&["S1"]));
        sensors.poll_once().await.unwrap();
        sensors.check_timeouts(Utc::now()).await;

        let alarm_id = {
            let state = api.state.lock();
            let alarm = state
                .events
                .iter()
                .find(|e| e.topic == TIMEOUT_TOPIC)
                .cloned()
                .unwrap();
            assert_eq!(alarm.data["active"], true);
            alarm.id
        };

        api.state.lock().events.push(status("S1", 0, "back"));
        sensors.poll_once().await.unwrap();

        let state = api.state.lock();
        let alarm = state.events.iter().find(|e| e.id == alarm_id).unwrap();
        assert_eq!(alarm.data["active"], false);
        assert!(alarm.data.get("resolvedAt").is_some());
        assert_eq!(alarm.data["sensorId"], "S1");
    }

    #[tokio::test]
    async fn test_open_timeout_from_earlier_session_is_reused() {
        let open = Event::from_new(NewEvent::new(
            Category::Alarm,
            TIMEOUT_TOPIC,
            json!({"sensorId": "S1", "message": "silent", "active": true}),
        ));
        let open_id = open.id;
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 10, "ok"), open]));
        let sensors = SensorReconciler::new(api.clone(), &config(&["S1"]));
        sensors.poll_once().await.unwrap();

        let raised = sensors.check_timeouts(Utc::now()).await;
        assert!(matches!(raised.as_slice(), [Raised::Created(_)]));
        assert!(api.state.lock().created.is_empty());

        api.state.lock().events.push(status("S1", 0, "back"));
        sensors.poll_once().await.unwrap();

        let state = api.state.lock();
        let alarm = state.events.iter().find(|e| e.id == open_id).unwrap();
        assert_eq!(alarm.data["active"], false);
    }

    #[tokio::test]
    async fn test_failed_resolution_is_retried() {
        let api = Arc::new(FakeApi::with_events(vec![status("S1", 10, "ok")]));
        let sensors = SensorReconciler::new(api.clone(), &config(&["S1"]));
        sensors.poll_once().await.unwrap();
        sensors.check_timeouts(Utc::now()).await;

        {
            let mut state = api.state.lock();
            state.fail_updates = true;
            state.events.push(status("S1", 0, "back"));
        }
        sensors.poll_once().await.unwrap();
        assert!(!sensors.has_active_alarms());

        let still_open = |api: &FakeApi| {
            api.state
                .lock()
                .events
                .iter()
                .any(|e| e.topic == TIMEOUT_TOPIC && e.data["active"] == true)
        };
        assert!(still_open(&api));

        api.state.lock().fail_updates = false;
        sensors.poll_once().await.unwrap();
        assert!(!still_open(&api));
    }
}
