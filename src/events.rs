use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TurnError;

/// Kinds of streaming output a turn can produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    Progress,
    Chunk,
    CityData,
    GeneralPoi,
    PersonalizedPoi,
    Itinerary,
    Response,
    ItineraryUpdate,
    Error,
    Complete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress => "progress",
            Self::Chunk => "chunk",
            Self::CityData => "city_data",
            Self::GeneralPoi => "general_poi",
            Self::PersonalizedPoi => "personalized_poi",
            Self::Itinerary => "itinerary",
            Self::Response => "response",
            Self::ItineraryUpdate => "itinerary_update",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }
}

/// One unit of streaming output. `id` and `timestamp` are stamped at emission
/// time when a producer leaves them empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_final: bool,
}

impl Event {
    /// Unstamped event; identity is assigned by [`Event::stamped`].
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: String::new(),
            event_type,
            timestamp: DateTime::<Utc>::default(),
            data: None,
            message: None,
            error: None,
            is_final: false,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn final_event(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn progress(message: impl Into<String>) -> Self {
        Self::new(EventType::Progress).with_message(message)
    }

    pub fn chunk(source: &str, fragment: &str) -> Self {
        Self::new(EventType::Chunk).with_data(serde_json::json!({
            "source": source,
            "chunk": fragment,
        }))
    }

    /// Error event carrying the classification of `err`.
    pub fn failure(err: &TurnError) -> Self {
        let mut event = Self::new(EventType::Error).with_data(serde_json::json!({ "kind": err.kind() }));
        event.error = Some(err.to_string());
        event
    }

    pub fn complete(data: Value) -> Self {
        Self::new(EventType::Complete)
            .with_data(data)
            .with_message("turn complete")
            .final_event()
    }

    /// Fill in a missing id or timestamp.
    pub fn stamped(mut self) -> Self {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.timestamp.timestamp_millis() == 0 {
            self.timestamp = Utc::now();
        }
        self
    }

    pub fn is_stamped(&self) -> bool {
        !self.id.is_empty() && self.timestamp.timestamp_millis() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamping_assigns_identity_once() {
        let event = Event::progress("working");
        assert!(!event.is_stamped());

        let stamped = event.stamped();
        assert!(stamped.is_stamped());

        let id = stamped.id.clone();
        let ts = stamped.timestamp;
        let again = stamped.stamped();
        assert_eq!(again.id, id);
        assert_eq!(again.timestamp, ts);
    }

    #[test]
    fn stamped_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..64).map(|_| Event::progress("x").stamped().id).collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn failure_event_carries_kind() {
        let event = Event::failure(&TurnError::SessionNotFound(Uuid::nil()));
        assert_eq!(event.event_type, EventType::Error);
        assert_eq!(event.data.as_ref().unwrap()["kind"], "session_not_found");
        assert!(event.error.as_deref().unwrap().contains("not found"));
        assert!(!event.is_final);
    }

    #[test]
    fn wire_format_uses_snake_case_types() {
        let json = serde_json::to_value(Event::complete(serde_json::json!({})).stamped()).unwrap();
        assert_eq!(json["event_type"], "complete");
        assert_eq!(json["is_final"], true);
        assert!(json.get("error").is_none());
    }
}
