//! Event model shared by the relay server and the operator console.
//!
//! An [`Event`] is a categorized, timestamped record. Events derived from bus
//! traffic start out as [`Category::Detect`]; operators and the console may
//! later acknowledge them, annotate them, or escalate them to
//! [`Category::Threat`]. Notes and escalation bookkeeping live inside the
//! event's `data` object so that the store only ever has to patch three fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Key under `data` holding the ordered note list
pub const NOTES_FIELD: &str = "notes";

/// Key under `data` holding the category an escalated event had before
pub const ORIGINAL_CATEGORY_FIELD: &str = "originalCategory";

/// Validation failures on event input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid event category: {0}")]
    InvalidCategory(String),

    #[error("Field {0} is immutable")]
    ImmutableField(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Request body must be a JSON object")]
    NotAnObject,
}

/// Severity/type tag on an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Detect,
    Alert,
    Alarm,
    Threat,
    /// Anything a peer sent that is not one of the four known values.
    /// Never accepted on writes.
    #[serde(other)]
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Detect => "DETECT",
            Category::Alert => "ALERT",
            Category::Alarm => "ALARM",
            Category::Threat => "THREAT",
            Category::Unknown => "UNKNOWN",
        }
    }

    /// Sort rank, lower is more severe
    pub fn rank(&self) -> u8 {
        match self {
            Category::Threat => 1,
            Category::Alarm => 2,
            Category::Alert => 3,
            Category::Detect => 4,
            Category::Unknown => 5,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Category::Unknown)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DETECT" => Ok(Category::Detect),
            "ALERT" => Ok(Category::Alert),
            "ALARM" => Ok(Category::Alarm),
            "THREAT" => Ok(Category::Threat),
            other => Err(ValidationError::InvalidCategory(other.to_string())),
        }
    }
}

/// Operator note attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
}

impl Note {
    pub fn new(text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            timestamp: Utc::now(),
            author: author.into(),
        }
    }
}

/// A stored event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub category: Category,
    pub topic: String,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
}

impl Event {
    /// Event derived from a bus message
    pub fn detect(topic: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: Category::Detect,
            topic: topic.into(),
            data,
            created_at: Utc::now(),
            acknowledged: false,
        }
    }

    /// Event created through the write API
    pub fn from_new(new: NewEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: new.category,
            topic: new.topic,
            data: new.data,
            created_at: Utc::now(),
            acknowledged: false,
        }
    }

    /// Notes recorded under `data.notes`, skipping entries that do not parse
    pub fn notes(&self) -> Vec<Note> {
        self.data
            .get(NOTES_FIELD)
            .and_then(Value::as_array)
            .map(|notes| {
                notes
                    .iter()
                    .filter_map(|n| serde_json::from_value(n.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pre-escalation category stashed in `data.originalCategory`
    pub fn original_category(&self) -> Option<Category> {
        self.data
            .get(ORIGINAL_CATEGORY_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Sensor identifier carried in the payload (`sensorId` or `sensor_id`)
    pub fn sensor_id(&self) -> Option<&str> {
        self.data
            .get("sensorId")
            .or_else(|| self.data.get("sensor_id"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Apply a patch in place
    pub fn apply(&mut self, patch: &EventPatch) {
        if let Some(acknowledged) = patch.acknowledged {
            self.acknowledged = acknowledged;
        }
        if let Some(category) = patch.category {
            self.category = category;
        }
        if let Some(ref data) = patch.data {
            self.data = data.clone();
        }
    }
}

/// Body of an event creation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub category: Category,
    pub topic: String,
    #[serde(default)]
    pub data: Value,
}

impl NewEvent {
    pub fn new(category: Category, topic: impl Into<String>, data: Value) -> Self {
        Self {
            category,
            topic: topic.into(),
            data,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.category.is_known() {
            return Err(ValidationError::InvalidCategory(
                self.category.as_str().to_string(),
            ));
        }
        if self.topic.trim().is_empty() {
            return Err(ValidationError::MissingField("topic".to_string()));
        }
        Ok(())
    }
}

/// Narrow update of an event. Only these three fields are mutable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl EventPatch {
    /// Parse an untyped request body, rejecting immutable and unknown fields
    pub fn from_json(body: Value) -> Result<Self, ValidationError> {
        let Value::Object(map) = body else {
            return Err(ValidationError::NotAnObject);
        };

        let mut patch = EventPatch::default();

        for (key, value) in map {
            match key.as_str() {
                "acknowledged" => {
                    let ack = value.as_bool().ok_or_else(|| ValidationError::InvalidValue {
                        field: key.clone(),
                        message: "expected a boolean".to_string(),
                    })?;
                    patch.acknowledged = Some(ack);
                }
                "category" => {
                    let raw = value.as_str().ok_or_else(|| ValidationError::InvalidValue {
                        field: key.clone(),
                        message: "expected a string".to_string(),
                    })?;
                    patch.category = Some(raw.parse()?);
                }
                "data" => patch.data = Some(value),
                "id" | "_id" | "createdAt" | "created_at" | "topic" => {
                    return Err(ValidationError::ImmutableField(key));
                }
                _ => return Err(ValidationError::UnknownField(key)),
            }
        }

        Ok(patch)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.category {
            Some(category) if !category.is_known() => Err(ValidationError::InvalidCategory(
                category.as_str().to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.acknowledged.is_none() && self.category.is_none() && self.data.is_none()
    }

    /// Flip `acknowledged` and record who did it. `None` if already acknowledged.
    pub fn acknowledge(event: &Event, author: &str) -> Option<Self> {
        if event.acknowledged {
            return None;
        }
        let mut data = data_object(&event.data);
        push_note(&mut data, Note::new("Event acknowledged", author));
        Some(Self {
            acknowledged: Some(true),
            data: Some(Value::Object(data)),
            ..Default::default()
        })
    }

    /// Append a free-form note
    pub fn add_note(event: &Event, text: &str, author: &str) -> Self {
        let mut data = data_object(&event.data);
        push_note(&mut data, Note::new(text, author));
        Self {
            data: Some(Value::Object(data)),
            ..Default::default()
        }
    }

    /// Escalate to THREAT, stashing the current category. `None` if already THREAT.
    pub fn escalate(event: &Event, author: &str) -> Option<Self> {
        if event.category == Category::Threat {
            return None;
        }
        let from = event.category;
        let mut data = data_object(&event.data);
        data.insert(
            ORIGINAL_CATEGORY_FIELD.to_string(),
            Value::String(from.as_str().to_string()),
        );
        push_note(
            &mut data,
            Note::new(format!("Escalated to THREAT from {}", from), author),
        );
        Some(Self {
            category: Some(Category::Threat),
            data: Some(Value::Object(data)),
            ..Default::default()
        })
    }

    /// Restore the stashed category. `None` unless the event is an escalated THREAT.
    pub fn revert(event: &Event, author: &str) -> Option<Self> {
        if event.category != Category::Threat {
            return None;
        }
        let original = event
            .original_category()
            .filter(|c| *c != Category::Threat && c.is_known())?;
        let mut data = data_object(&event.data);
        data.remove(ORIGINAL_CATEGORY_FIELD);
        push_note(
            &mut data,
            Note::new(format!("Reverted from THREAT back to {}", original), author),
        );
        Some(Self {
            category: Some(original),
            data: Some(Value::Object(data)),
            ..Default::default()
        })
    }
}

/// `data` as an object. Non-object payloads are wrapped under `value`.
fn data_object(data: &Value) -> Map<String, Value> {
    match data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    }
}

fn push_note(data: &mut Map<String, Value>, note: Note) {
    let note = serde_json::to_value(note).unwrap_or(Value::Null);
    match data.get_mut(NOTES_FIELD) {
        Some(Value::Array(notes)) => notes.push(note),
        _ => {
            data.insert(NOTES_FIELD.to_string(), Value::Array(vec![note]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_with(category: Category) -> Event {
        let mut event = Event::detect("gas", json!({"co2": 900}));
        event.category = category;
        event
    }

    #[test]
    fn test_category_wire_format() {
        assert_eq!(serde_json::to_string(&Category::Threat).unwrap(), "\"THREAT\"");
        let parsed: Category = serde_json::from_str("\"ALERT\"").unwrap();
        assert_eq!(parsed, Category::Alert);
        let unknown: Category = serde_json::from_str("\"SOMETHING\"").unwrap();
        assert_eq!(unknown, Category::Unknown);
    }

    #[test]
    fn test_category_rank_order() {
        assert!(Category::Threat.rank() < Category::Alarm.rank());
        assert!(Category::Alarm.rank() < Category::Alert.rank());
        assert!(Category::Alert.rank() < Category::Detect.rank());
        assert_eq!(Category::Unknown.rank(), 5);
    }

    #[test]
    fn test_category_parse_rejects_unknown() {
        assert!("THREAT".parse::<Category>().is_ok());
        assert_eq!(
            "threat".parse::<Category>(),
            Err(ValidationError::InvalidCategory("threat".to_string()))
        );
        assert!("UNKNOWN".parse::<Category>().is_err());
    }

    #[test]
    fn test_event_json_uses_camel_case() {
        let event = Event::detect("gas", json!({"co2": 900}));
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("createdAt").is_some());
        assert_eq!(value["category"], "DETECT");
        assert_eq!(value["acknowledged"], false);
    }

    #[test]
    fn test_sensor_id_accepts_both_spellings() {
        let a = Event::detect("sensor_status", json!({"sensorId": "S1"}));
        let b = Event::detect("sensor_status", json!({"sensor_id": "S2"}));
        let c = Event::detect("sensor_status", json!({"status": "ok"}));
        assert_eq!(a.sensor_id(), Some("S1"));
        assert_eq!(b.sensor_id(), Some("S2"));
        assert_eq!(c.sensor_id(), None);
    }

    #[test]
    fn test_new_event_validation() {
        let ok = NewEvent::new(Category::Alarm, "sensor_timeout", json!({}));
        assert!(ok.validate().is_ok());

        let bad = NewEvent::new(Category::Unknown, "x", json!({}));
        assert!(matches!(bad.validate(), Err(ValidationError::InvalidCategory(_))));

        let no_topic = NewEvent::new(Category::Alert, " ", json!({}));
        assert!(matches!(no_topic.validate(), Err(ValidationError::MissingField(_))));
    }

    #[test]
    fn test_patch_rejects_immutable_fields() {
        let err = EventPatch::from_json(json!({"createdAt": "2024-01-01T00:00:00Z"})).unwrap_err();
        assert_eq!(err, ValidationError::ImmutableField("createdAt".to_string()));

        let err = EventPatch::from_json(json!({"id": "abc", "acknowledged": true})).unwrap_err();
        assert_eq!(err, ValidationError::ImmutableField("id".to_string()));
    }

    #[test]
    fn test_patch_rejects_bad_category() {
        let err = EventPatch::from_json(json!({"category": "CRITICAL"})).unwrap_err();
        assert_eq!(err, ValidationError::InvalidCategory("CRITICAL".to_string()));
    }

    #[test]
    fn test_patch_parses_mutable_fields() {
        let patch =
            EventPatch::from_json(json!({"acknowledged": true, "category": "ALERT", "data": {"a": 1}}))
                .unwrap();
        assert_eq!(patch.acknowledged, Some(true));
        assert_eq!(patch.category, Some(Category::Alert));
        assert_eq!(patch.data, Some(json!({"a": 1})));
    }

    #[test]
    fn test_acknowledge_appends_note_once() {
        let mut event = event_with(Category::Alert);
        let patch = EventPatch::acknowledge(&event, "ops").unwrap();
        event.apply(&patch);

        assert!(event.acknowledged);
        assert_eq!(event.notes().len(), 1);
        assert_eq!(event.notes()[0].text, "Event acknowledged");
        assert!(EventPatch::acknowledge(&event, "ops").is_none());
    }

    #[test]
    fn test_escalate_then_revert_restores_category() {
        let mut event = event_with(Category::Alert);

        let escalate = EventPatch::escalate(&event, "ops").unwrap();
        event.apply(&escalate);
        assert_eq!(event.category, Category::Threat);
        assert_eq!(event.original_category(), Some(Category::Alert));
        assert!(EventPatch::escalate(&event, "ops").is_none());

        let revert = EventPatch::revert(&event, "ops").unwrap();
        event.apply(&revert);
        assert_eq!(event.category, Category::Alert);
        assert!(event.data.get(ORIGINAL_CATEGORY_FIELD).is_none());
        assert!(EventPatch::revert(&event, "ops").is_none());

        let notes = event.notes();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].text, "Escalated to THREAT from ALERT");
        assert_eq!(notes[1].text, "Reverted from THREAT back to ALERT");
        assert_eq!(event.data["co2"], 900);
    }

    #[test]
    fn test_native_threat_cannot_be_reverted() {
        let event = event_with(Category::Threat);
        assert!(EventPatch::revert(&event, "ops").is_none());
    }

    #[test]
    fn test_note_on_scalar_payload_wraps_value() {
        let event = Event::detect("counter", json!(42));
        let patch = EventPatch::add_note(&event, "checked", "ops");
        let data = patch.data.unwrap();
        assert_eq!(data["value"], 42);
        assert_eq!(data["notes"].as_array().unwrap().len(), 1);
    }
}
