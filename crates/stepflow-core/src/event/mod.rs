use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, StepflowError};

const MAX_NAME_LEN: usize = 255;
const MAX_ID_LEN: usize = 255;

/// An ingested event. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID (caller-supplied or generated).
    pub id: String,
    /// Event name used for routing, e.g. `demo/generate`.
    pub name: String,
    /// Event payload (always a JSON object).
    pub payload: serde_json::Value,
    /// When the event was first received.
    pub received_at: DateTime<Utc>,
}

/// An event as submitted to the dispatcher, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEvent {
    /// Event name.
    pub name: String,
    /// Optional idempotency ID. Redelivery must reuse the same ID.
    #[serde(default)]
    pub id: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewEvent {
    /// Create an event without an explicit ID.
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            id: None,
            payload,
        }
    }

    /// Set the event ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Validate the event and assign an ID if none was supplied.
    pub fn into_event(self) -> Result<Event> {
        validate_name(&self.name)?;

        let id = match self.id {
            Some(id) => {
                validate_id(&id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let payload = match self.payload {
            serde_json::Value::Null => serde_json::json!({}),
            payload @ serde_json::Value::Object(_) => payload,
            other => {
                return Err(StepflowError::Dispatch(format!(
                    "event '{}' payload must be an object, got {}",
                    self.name,
                    json_type(&other)
                )))
            }
        };

        Ok(Event {
            id,
            name: self.name,
            payload,
            received_at: Utc::now(),
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StepflowError::Dispatch("event name is empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StepflowError::Dispatch(format!(
            "event name exceeds {} bytes",
            MAX_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':')))
    {
        return Err(StepflowError::Dispatch(format!(
            "event name '{}' contains invalid character {:?}",
            name, c
        )));
    }
    Ok(())
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(StepflowError::Dispatch("event id is empty".into()));
    }
    if id.len() > MAX_ID_LEN || id.chars().any(char::is_whitespace) {
        return Err(StepflowError::Dispatch(format!("event id '{}' is invalid", id)));
    }
    Ok(())
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
